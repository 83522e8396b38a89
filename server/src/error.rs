use std::net::SocketAddr;

use shared::ProtocolError;
use thiserror::Error;

/// Errors from the cross-thread chunk queues.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The record would exceed the record count or byte capacity.
    #[error("queue is full")]
    Full,

    /// The record is larger than the queue's byte capacity and could never
    /// be written.
    #[error("record of {len} bytes exceeds the queue capacity of {max} bytes")]
    RecordTooLarge { len: usize, max: usize },

    /// Records must carry at least one byte.
    #[error("cannot queue an empty record")]
    EmptyRecord,

    /// The other endpoint is gone; for the command queue this means the
    /// network loop has stopped.
    #[error("queue is closed")]
    Closed,
}

/// Errors surfaced by the network service.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The supplied configuration cannot be used.
    #[error("Invalid network config: {0}")]
    Config(String),

    /// Creating, binding or listening on the server socket failed.
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The network thread or its runtime could not be started.
    #[error("Failed to start network thread: {0}")]
    Runtime(#[source] std::io::Error),

    /// The network thread panicked.
    #[error("Network thread panicked")]
    ThreadPanicked,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A command or event record could not be (de)serialized.
    #[error("Record encoding error: {0}")]
    Record(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O failure on a client socket.
    #[error("Client IO error: {0}")]
    Io(#[from] std::io::Error),
}
