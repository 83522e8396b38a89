//! Per-connection state owned by the network loop
//!
//! A registered client is split across three places:
//! - The [`Client`] record in the registry, holding its identity, the bytes
//!   received but not yet framed, and the sending end of its outbound queue
//! - A reader task that owns the socket's read half
//! - A writer task that owns the socket's write half and drains the outbound
//!   queue
//!
//! The loop never writes to a socket itself. Outbound messages are handed to
//! the writer task through a bounded queue, so a peer that stops reading can
//! only fill its own queue and never stalls the loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use shared::{try_decode_message, NetMessage, ProtocolError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::{NetworkError, QueueError};

/// Stable identity of a connected client.
///
/// Assigned by the registry on accept and never reused while the service
/// runs, unlike OS socket handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work item for a client's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded message bytes, shared between every recipient of a broadcast
    Bytes(Arc<[u8]>),
    /// Close the sending side once everything queued before it is written
    Shutdown,
}

/// Bytes received from a client that have not been framed into messages yet
#[derive(Debug, Default)]
pub struct InboundBuffer {
    bytes: Vec<u8>,
}

impl InboundBuffer {
    /// Appends freshly read bytes after whatever is already buffered
    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Buffered bytes, oldest first
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Discards the first `count` bytes
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.bytes.len());
        self.bytes.drain(..count.min(self.bytes.len()));
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A registered connection, as seen by the network loop.
///
/// The reader and writer tasks are aborted when the client is dropped, which
/// releases both halves of the socket.
pub struct Client {
    /// Unique identifier assigned by the registry
    pub id: ClientId,
    /// Peer address reported by accept
    pub addr: SocketAddr,
    /// When the connection was registered
    pub connected_at: Instant,
    /// Received bytes waiting to be framed
    pub inbound: InboundBuffer,
    outbound: mpsc::Sender<Outbound>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    shutdown_requested: bool,
}

impl Client {
    /// Creates a client record around the sending end of its outbound queue
    ///
    /// The matching receiver belongs to the writer task, which the caller
    /// spawns and attaches with [`attach_tasks`](Self::attach_tasks).
    pub fn new(id: ClientId, addr: SocketAddr, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            inbound: InboundBuffer::default(),
            outbound,
            reader_task: None,
            writer_task: None,
            shutdown_requested: false,
        }
    }

    /// Ties the socket tasks' lifetime to this client
    ///
    /// Any previously attached tasks are aborted first.
    pub fn attach_tasks(&mut self, reader: JoinHandle<()>, writer: JoinHandle<()>) {
        if let Some(previous) = self.reader_task.replace(reader) {
            previous.abort();
        }
        if let Some(previous) = self.writer_task.replace(writer) {
            previous.abort();
        }
    }

    /// Whether the server has already asked this connection to close
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// How long the client has been registered
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames the next complete message out of the inbound buffer.
    ///
    /// `Ok(None)` means the buffer holds no complete message yet. An error
    /// leaves the buffer untouched; the connection cannot be resynchronised.
    pub fn next_message(&mut self) -> Result<Option<NetMessage>, ProtocolError> {
        match try_decode_message(self.inbound.as_slice())? {
            Some((message, consumed)) => {
                self.inbound.consume(consumed);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Encodes a message and queues it for the writer task
    ///
    /// Fails with [`QueueError::Full`] when the peer has fallen too far
    /// behind, and with [`QueueError::Closed`] once the writer task is gone.
    pub fn send(&mut self, message: &NetMessage) -> Result<(), NetworkError> {
        let bytes: Arc<[u8]> = message.to_bytes()?.into();
        self.send_bytes(bytes)?;
        Ok(())
    }

    /// Queues already encoded bytes without waiting
    pub fn send_bytes(&mut self, bytes: Arc<[u8]>) -> Result<(), QueueError> {
        self.push(Outbound::Bytes(bytes))
    }

    /// Asks the writer task to shut down the sending side after everything
    /// already queued, so the peer sees end-of-stream.
    ///
    /// The client stays registered until the peer closes its end. The
    /// request counts as made even if it could not be queued.
    pub fn request_shutdown(&mut self) -> Result<(), QueueError> {
        self.shutdown_requested = true;
        self.push(Outbound::Shutdown)
    }

    fn push(&mut self, item: Outbound) -> Result<(), QueueError> {
        self.outbound.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("buffered", &self.inbound.len())
            .field("shutdown_requested", &self.shutdown_requested)
            .finish()
    }
}

/// Test suite for client state, framing and the outbound queue
#[cfg(test)]
mod tests {
    use super::*;
    use shared::{OrderMessage, StartMessage, Target};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_client(capacity: usize) -> (Client, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Client::new(ClientId(1), test_addr(), tx), rx)
    }

    #[test]
    fn test_inbound_buffer_consume() {
        let mut buffer = InboundBuffer::default();
        assert!(buffer.is_empty());

        buffer.append(&[1, 2, 3]);
        buffer.append(&[4]);
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4]);

        buffer.consume(3);
        assert_eq!(buffer.as_slice(), &[4]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_next_message_reassembles_split_input() {
        let (mut client, _rx) = test_client(4);
        let order = OrderMessage {
            target: Target { x: 10, y: -20 },
            unit_ids: vec![4, 5, 6],
        };
        let bytes = NetMessage::Order(order.clone()).to_bytes().unwrap();
        assert_eq!(bytes.len(), 15);

        client.inbound.append(&bytes[..4]);
        assert_eq!(client.next_message().unwrap(), None);

        client.inbound.append(&bytes[4..12]);
        assert_eq!(client.next_message().unwrap(), None);

        client.inbound.append(&bytes[12..]);
        client.inbound.append(&[1]);
        assert_eq!(client.next_message().unwrap(), Some(NetMessage::Order(order)));
        assert_eq!(client.next_message().unwrap(), Some(NetMessage::Reply));
        assert_eq!(client.next_message().unwrap(), None);
        assert!(client.inbound.is_empty());
    }

    #[test]
    fn test_next_message_reports_bad_tag() {
        let (mut client, _rx) = test_client(4);
        client.inbound.append(&[1, 42]);

        assert_eq!(client.next_message().unwrap(), Some(NetMessage::Reply));
        assert_eq!(
            client.next_message(),
            Err(ProtocolError::UnknownMessageType(42))
        );
        assert_eq!(client.inbound.len(), 1);
    }

    #[test]
    fn test_send_queues_encoded_message() {
        let (mut client, mut rx) = test_client(4);

        let start = NetMessage::Start(StartMessage::new(3, 1).unwrap());
        client.send(&start).unwrap();
        client.send(&NetMessage::Reply).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Bytes(Arc::from(&[0u8, 3, 1][..])));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Bytes(Arc::from(&[1u8][..])));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_fails_when_peer_falls_behind() {
        let (mut client, _rx) = test_client(2);

        client.send(&NetMessage::Reply).unwrap();
        client.send(&NetMessage::Reply).unwrap();
        assert!(matches!(
            client.send(&NetMessage::Reply),
            Err(NetworkError::Queue(QueueError::Full))
        ));
    }

    #[test]
    fn test_send_after_writer_exit() {
        let (mut client, rx) = test_client(2);
        drop(rx);

        assert_eq!(
            client.send_bytes(Arc::from(&[1u8][..])),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn test_shutdown_request_follows_queued_data() {
        let (mut client, mut rx) = test_client(4);
        assert!(!client.shutdown_requested());

        client.send(&NetMessage::Reply).unwrap();
        client.request_shutdown().unwrap();
        assert!(client.shutdown_requested());

        assert!(matches!(rx.try_recv().unwrap(), Outbound::Bytes(_)));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Shutdown);
    }

    #[test]
    fn test_shutdown_request_marks_client_even_when_full() {
        let (mut client, _rx) = test_client(1);
        client.send(&NetMessage::Reply).unwrap();

        assert_eq!(client.request_shutdown(), Err(QueueError::Full));
        assert!(client.shutdown_requested());
    }

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let (mut client, _rx) = test_client(1);
        let (reader_alive, reader_gone) = tokio::sync::oneshot::channel::<()>();
        let (writer_alive, writer_gone) = tokio::sync::oneshot::channel::<()>();

        client.attach_tasks(
            tokio::spawn(async move {
                let _alive = reader_alive;
                std::future::pending::<()>().await
            }),
            tokio::spawn(async move {
                let _alive = writer_alive;
                std::future::pending::<()>().await
            }),
        );
        drop(client);

        let timeout = Duration::from_secs(1);
        assert!(tokio::time::timeout(timeout, reader_gone).await.unwrap().is_err());
        assert!(tokio::time::timeout(timeout, writer_gone).await.unwrap().is_err());
    }
}
