//! Settings for a network service instance

use std::net::{Ipv4Addr, SocketAddr};

use shared::MAX_MESSAGE_SIZE;

use crate::error::NetworkError;

pub const DEFAULT_PORT: u16 = 4321;
pub const DEFAULT_BACKLOG: u32 = 5;
pub const DEFAULT_MAX_CLIENTS: usize = 8;
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_OUTBOUND_QUEUE_LEN: usize = 64;

/// Upper bound on a serialized command or event record: the largest wire
/// message plus the record's own framing (variant tags, client ID, lengths).
pub const MAX_RECORD_SIZE: usize = MAX_MESSAGE_SIZE + 64;

/// Bounds of a chunk queue: outstanding records and total payload bytes.
///
/// `max_bytes` must leave room for at least one record of
/// [`MAX_RECORD_SIZE`], otherwise the largest order could never be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_records: 50,
            max_bytes: 256 * 1024,
        }
    }
}

/// Configuration for [`NetworkService::start`](crate::network::NetworkService::start)
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the listening socket binds to
    pub bind_addr: SocketAddr,
    /// Pending connection queue length handed to `listen`
    pub backlog: u32,
    /// Upper bound on simultaneously registered clients
    pub max_clients: usize,
    /// Size of a single socket read
    pub receive_buffer_size: usize,
    /// Messages that may wait for a slow peer before it is disconnected
    pub outbound_queue_len: usize,
    pub command_queue: QueueLimits,
    pub event_queue: QueueLimits,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            backlog: DEFAULT_BACKLOG,
            max_clients: DEFAULT_MAX_CLIENTS,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            outbound_queue_len: DEFAULT_OUTBOUND_QUEUE_LEN,
            command_queue: QueueLimits::default(),
            event_queue: QueueLimits::default(),
        }
    }
}

impl NetworkConfig {
    /// Rejects settings the event loop cannot run with
    ///
    /// Every limit must be non-zero, and both queues must be able to hold
    /// the largest possible record.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.max_clients == 0 {
            return Err(NetworkError::Config("max_clients must be at least 1".into()));
        }
        if self.receive_buffer_size == 0 {
            return Err(NetworkError::Config(
                "receive_buffer_size must be at least 1".into(),
            ));
        }
        if self.outbound_queue_len == 0 {
            return Err(NetworkError::Config(
                "outbound_queue_len must be at least 1".into(),
            ));
        }
        for (name, limits) in [
            ("command_queue", self.command_queue),
            ("event_queue", self.event_queue),
        ] {
            if limits.max_records == 0 || limits.max_bytes == 0 {
                return Err(NetworkError::Config(format!(
                    "{} limits must be non-zero",
                    name
                )));
            }
            if limits.max_bytes < MAX_RECORD_SIZE {
                return Err(NetworkError::Config(format!(
                    "{}.max_bytes must be at least {} to carry the largest message",
                    name, MAX_RECORD_SIZE
                )));
            }
        }
        Ok(())
    }
}
