//! Network event loop and its cross-thread command/event interface
//!
//! The loop runs on a dedicated thread with its own current-thread tokio
//! runtime. The control thread never touches sockets or the client registry;
//! it talks to the loop through two chunk queues:
//!
//! - **Command queue** (control → network): every submission is followed by
//!   a wake signal, and the loop drains the whole queue on each wake.
//! - **Event queue** (network → control): connects, disconnects and framed
//!   inbound messages, in the order the loop observed them. Polled, never
//!   pushed.
//!
//! Each client has a reader task that forwards raw reads to the loop and a
//! writer task that drains the client's bounded outbound queue. Framing,
//! registry updates and event emission all happen on the loop itself, so
//! per-client ordering is preserved, and the loop never waits on a socket.
//!
//! Events are never dropped. When the event queue is full they are held back
//! in order, and the loop stops accepting and stops taking client reads
//! until the control thread has polled enough to make room. Reader tasks
//! then block on the bounded activity channel, which pushes back on peers
//! through TCP.
//!
//! Lifecycle: `Running` → (`DisconnectAll`) → `Disconnecting` → (registry
//! empty) → `Stopped`. No new connections are accepted once disconnecting.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::NetMessage;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::client::{ClientId, Outbound};
use crate::client_manager::ClientRegistry;
use crate::config::NetworkConfig;
use crate::error::{NetworkError, QueueError};
use crate::queue::{chunk_queue, ChunkConsumer, ChunkProducer, WakeSignal};

/// Client activity reports that may wait for the loop before reader and
/// writer tasks block
const ACTIVITY_QUEUE_LEN: usize = 64;

/// Why a client left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Peer closed the connection on its own
    Closed,
    /// Read or write failed (connection reset, aborted, ...)
    Reset,
    /// Peer sent bytes that are not a valid message
    ProtocolViolation,
    /// Peer closed after the server shut the connection down
    Requested,
    /// Peer stopped reading and its outbound queue filled up
    Unresponsive,
}

/// Notifications from the network loop to the control thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkEvent {
    ClientConnected {
        client: ClientId,
        addr: SocketAddr,
    },
    ClientDisconnected {
        client: ClientId,
        reason: DisconnectReason,
    },
    MessageReceived {
        client: ClientId,
        message: NetMessage,
    },
}

/// Requests from the control thread to the network loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Shut down every client and stop once all of them are gone
    DisconnectAll,
    /// Shut down a single client
    DisconnectClient { client: ClientId },
    /// Queue a message for one client
    Send {
        client: ClientId,
        message: NetMessage,
    },
    /// Queue a message for every client that is not shutting down
    Broadcast { message: NetMessage },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Disconnecting,
    Stopped,
}

/// What a client's reader or writer task reports back to the loop
#[derive(Debug)]
enum ClientActivity {
    Received { client: ClientId, bytes: Vec<u8> },
    Closed { client: ClientId },
    Failed {
        client: ClientId,
        error: std::io::Error,
    },
}

/// Entry point for starting the networking layer
pub struct NetworkService;

impl NetworkService {
    /// Binds the listening socket and starts the network thread.
    ///
    /// The socket is bound before any runtime exists, so this can be called
    /// from inside another tokio runtime. Socket setup failures are returned
    /// here; nothing is retried.
    pub fn start(config: NetworkConfig) -> Result<NetworkHandle, NetworkError> {
        config.validate()?;

        let listener = bind_listener(&config)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| NetworkError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        info!("Server listening on {}", local_addr);

        let (command_tx, command_rx) = chunk_queue(config.command_queue);
        let (event_tx, event_rx) = chunk_queue(config.event_queue);
        let wake = WakeSignal::new();
        let loop_wake = wake.clone();

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let thread = thread::Builder::new()
            .name("network".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let listener = {
                    let _guard = runtime.enter();
                    TcpListener::from_std(listener)
                };
                let listener = match listener {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let event_loop = EventLoop::new(listener, &config, command_rx, event_tx, loop_wake);
                runtime.block_on(event_loop.run());
            })
            .map_err(NetworkError::Runtime)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(NetworkError::Runtime(e));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(NetworkError::ThreadPanicked);
            }
        }

        Ok(NetworkHandle {
            commands: command_tx,
            events: event_rx,
            wake,
            local_addr,
            thread: Some(thread),
        })
    }
}

/// Creates a non-blocking listening socket with the configured backlog
fn bind_listener(config: &NetworkConfig) -> Result<StdTcpListener, NetworkError> {
    let addr = config.bind_addr;
    let bind_error = |source| NetworkError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    Ok(socket.into())
}

/// Control-thread side of a running network service
pub struct NetworkHandle {
    commands: ChunkProducer,
    events: ChunkConsumer,
    wake: WakeSignal,
    local_addr: SocketAddr,
    thread: Option<thread::JoinHandle<()>>,
}

impl NetworkHandle {
    /// Address the listener actually bound to
    ///
    /// Differs from the configured address when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues a command and wakes the network loop
    ///
    /// Fails with [`QueueError::Full`] when the loop has not caught up with
    /// earlier commands, and with [`QueueError::Closed`] once it has stopped.
    pub fn submit_command(&self, command: &Command) -> Result<(), NetworkError> {
        let record = serialize(command)?;
        self.commands.write(record)?;
        self.wake.wake();
        Ok(())
    }

    /// Starts the orderly shutdown of every connection
    ///
    /// The loop stops once all peers have closed their end.
    pub fn disconnect_all(&self) -> Result<(), NetworkError> {
        self.submit_command(&Command::DisconnectAll)
    }

    /// Takes the next event without blocking
    ///
    /// Returns `None` when nothing is queued, no matter how often it is
    /// called. Polling also lets the loop release events it held back.
    pub fn poll_event(&mut self) -> Option<NetworkEvent> {
        loop {
            let record = self.events.read()?;
            match deserialize(&record) {
                Ok(event) => return Some(event),
                Err(e) => error!("Discarding malformed event record: {}", e),
            }
        }
    }

    /// Whether the network loop has exited
    pub fn is_stopped(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(true, |thread| thread.is_finished())
    }

    /// Blocks until the network loop exits on its own
    pub fn join(mut self) -> Result<(), NetworkError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| NetworkError::ThreadPanicked),
            None => Ok(()),
        }
    }

    /// Disconnects every client and waits for the loop to stop. Returns once
    /// all peers have closed their end.
    ///
    /// Events that are still queued at that point are discarded with the
    /// handle.
    pub fn stop(self) -> Result<(), NetworkError> {
        match self.disconnect_all() {
            Ok(()) | Err(NetworkError::Queue(QueueError::Closed)) => {}
            Err(e) => return Err(e),
        }
        self.join()
    }
}

impl Drop for NetworkHandle {
    fn drop(&mut self) {
        if !self.is_stopped() {
            debug!("Network handle dropped while running, requesting disconnect");
            let _ = self.disconnect_all();
        }
    }
}

/// Event queue writer that holds events back instead of dropping them
///
/// Once one event has been held, every later event queues behind it so the
/// control thread still sees them in order.
struct EventOutbox {
    queue: ChunkProducer,
    held: VecDeque<Vec<u8>>,
}

impl EventOutbox {
    fn new(queue: ChunkProducer) -> Self {
        Self {
            queue,
            held: VecDeque::new(),
        }
    }

    /// Whether events are waiting for the control thread to poll
    fn is_backed_up(&self) -> bool {
        !self.held.is_empty()
    }

    fn publish(&mut self, event: &NetworkEvent) {
        let record = match serialize(event) {
            Ok(record) => record,
            Err(e) => {
                error!("Cannot encode event {:?}: {}", event, e);
                return;
            }
        };

        if !self.is_backed_up() && self.queue.has_room(record.len()) {
            if let Err(e) = self.queue.write(record) {
                error!("Dropping event {:?}: {}", event, e);
            }
        } else if record.len() > self.queue.max_bytes() {
            error!(
                "Dropping event {:?}: record of {} bytes can never be queued",
                event,
                record.len()
            );
        } else {
            if !self.is_backed_up() {
                debug!(
                    "Event queue full with {} bytes queued, holding events",
                    self.queue.queued_bytes()
                );
            }
            self.held.push_back(record);
        }
    }

    /// Moves held events into the queue while they fit
    fn flush(&mut self) {
        while let Some(record) = self.held.front() {
            if !self.queue.has_room(record.len()) {
                return;
            }
            let Some(record) = self.held.pop_front() else {
                return;
            };
            if let Err(e) = self.queue.write(record) {
                error!("Dropping held event record: {}", e);
            }
        }
        debug!("Released all held events");
    }

    async fn writable(&self) {
        self.queue.writable().await;
    }
}

/// State owned by the network thread
struct EventLoop {
    listener: TcpListener,
    clients: ClientRegistry,
    commands: ChunkConsumer,
    outbox: EventOutbox,
    wake: WakeSignal,
    activity_tx: mpsc::Sender<ClientActivity>,
    activity_rx: mpsc::Receiver<ClientActivity>,
    receive_buffer_size: usize,
    outbound_queue_len: usize,
    state: LoopState,
}

impl EventLoop {
    fn new(
        listener: TcpListener,
        config: &NetworkConfig,
        commands: ChunkConsumer,
        events: ChunkProducer,
        wake: WakeSignal,
    ) -> Self {
        let (activity_tx, activity_rx) = mpsc::channel(ACTIVITY_QUEUE_LEN);
        Self {
            listener,
            clients: ClientRegistry::new(config.max_clients),
            commands,
            outbox: EventOutbox::new(events),
            wake,
            activity_tx,
            activity_rx,
            receive_buffer_size: config.receive_buffer_size,
            outbound_queue_len: config.outbound_queue_len,
            state: LoopState::Running,
        }
    }

    fn can_accept(&self) -> bool {
        self.state == LoopState::Running && !self.clients.is_full()
    }

    async fn run(mut self) {
        info!("Network loop started");

        while self.state != LoopState::Stopped {
            let backed_up = self.outbox.is_backed_up();
            let accepting = self.can_accept() && !backed_up;
            // Shutdown must be able to finish even if nobody polls events
            let reading = !backed_up || self.state != LoopState::Running;

            tokio::select! {
                biased;

                _ = self.wake.wait() => {
                    self.process_commands();
                }
                _ = self.outbox.writable(), if backed_up => {
                    self.outbox.flush();
                }
                accepted = self.listener.accept(), if accepting => {
                    self.handle_accept(accepted);
                }
                Some(activity) = self.activity_rx.recv(), if reading => {
                    self.handle_activity(activity);
                }
            }

            if self.state == LoopState::Disconnecting && self.clients.is_empty() {
                info!("No more clients, stopping");
                self.state = LoopState::Stopped;
            }
        }

        self.outbox.flush();
        if self.outbox.is_backed_up() {
            error!(
                "Network loop stopped with {} events nobody polled",
                self.outbox.held.len()
            );
        }
        info!("Network loop stopped");
    }

    /// Applies every queued command; wakes may have coalesced
    fn process_commands(&mut self) {
        while let Some(record) = self.commands.read() {
            match deserialize::<Command>(&record) {
                Ok(command) => self.apply_command(command),
                Err(e) => error!("Discarding malformed command record: {}", e),
            }
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::DisconnectAll => {
                if self.state == LoopState::Running {
                    info!("Disconnecting {} clients", self.clients.len());
                    self.state = LoopState::Disconnecting;
                }
                for id in self.clients.ids() {
                    let result = match self.clients.get_mut(id) {
                        Some(entry) if !entry.shutdown_requested() => entry.request_shutdown(),
                        _ => continue,
                    };
                    debug!("Shutting down client {}", id);
                    if let Err(e) = result {
                        self.handle_send_failure(id, e);
                    }
                }
            }
            Command::DisconnectClient { client } => {
                let result = match self.clients.get_mut(client) {
                    Some(entry) => entry.request_shutdown(),
                    None => {
                        warn!("Disconnect requested for unknown client {}", client);
                        return;
                    }
                };
                if let Err(e) = result {
                    self.handle_send_failure(client, e);
                }
            }
            Command::Send { client, message } => {
                let result = match self.clients.get_mut(client) {
                    Some(entry) => entry.send(&message),
                    None => {
                        warn!("Dropping message for unknown client {}", client);
                        return;
                    }
                };
                match result {
                    Ok(()) => {}
                    Err(NetworkError::Queue(e)) => self.handle_send_failure(client, e),
                    Err(e) => error!("Cannot send {:?} to client {}: {}", message, client, e),
                }
            }
            Command::Broadcast { message } => {
                let bytes: Arc<[u8]> = match message.to_bytes() {
                    Ok(bytes) => bytes.into(),
                    Err(e) => {
                        error!("Cannot encode broadcast message: {}", e);
                        return;
                    }
                };
                for id in self.clients.ids() {
                    let result = match self.clients.get_mut(id) {
                        Some(entry) if !entry.shutdown_requested() => {
                            entry.send_bytes(Arc::clone(&bytes))
                        }
                        _ => continue,
                    };
                    if let Err(e) = result {
                        self.handle_send_failure(id, e);
                    }
                }
            }
        }
    }

    /// Reacts to an outbound queue that refused a message or shutdown
    fn handle_send_failure(&mut self, client: ClientId, error: QueueError) {
        match error {
            QueueError::Full => {
                warn!("Client {} is not reading, disconnecting", client);
                self.remove_client(client, DisconnectReason::Unresponsive);
            }
            // The writer has exited; its failure report is on the way
            QueueError::Closed => debug!("Writer for client {} already finished", client),
            other => error!("Cannot queue data for client {}: {}", client, other),
        }
    }

    fn handle_accept(&mut self, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue_len);
        let Some(client) = self.clients.insert(addr, outbound_tx) else {
            warn!("Cannot register connection from {}, dropping it", addr);
            return;
        };

        let id = client.id;
        client.attach_tasks(
            tokio::spawn(read_client(
                id,
                reader,
                self.activity_tx.clone(),
                self.receive_buffer_size,
            )),
            tokio::spawn(write_client(
                id,
                writer,
                outbound_rx,
                self.activity_tx.clone(),
            )),
        );
        debug!("Watching {} clients", self.clients.len());

        self.outbox
            .publish(&NetworkEvent::ClientConnected { client: id, addr });
    }

    fn handle_activity(&mut self, activity: ClientActivity) {
        match activity {
            ClientActivity::Received { client, bytes } => {
                let Some(entry) = self.clients.get_mut(client) else {
                    // Already removed; late reads are dropped
                    return;
                };
                debug!("Received {} bytes from client {}", bytes.len(), client);
                entry.inbound.append(&bytes);

                loop {
                    match entry.next_message() {
                        Ok(Some(message)) => {
                            let event = NetworkEvent::MessageReceived { client, message };
                            self.outbox.publish(&event);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Protocol violation from client {}: {}", client, e);
                            self.remove_client(client, DisconnectReason::ProtocolViolation);
                            break;
                        }
                    }
                }
            }
            ClientActivity::Closed { client } => {
                let reason = match self.clients.get_mut(client) {
                    Some(entry) if entry.shutdown_requested() => DisconnectReason::Requested,
                    Some(entry) => {
                        if !entry.inbound.is_empty() {
                            debug!(
                                "Client {} closed with {} unframed bytes",
                                client,
                                entry.inbound.len()
                            );
                        }
                        DisconnectReason::Closed
                    }
                    None => return,
                };
                self.remove_client(client, reason);
            }
            ClientActivity::Failed { client, error } => {
                if self.clients.contains(client) {
                    warn!("Connection to client {} failed: {}", client, error);
                    self.remove_client(client, DisconnectReason::Reset);
                }
            }
        }
    }

    /// Drops the connection and reports the disconnect
    fn remove_client(&mut self, client: ClientId, reason: DisconnectReason) {
        if let Some(entry) = self.clients.remove(client) {
            drop(entry);
            debug!("Watching {} clients", self.clients.len());
            self.outbox
                .publish(&NetworkEvent::ClientDisconnected { client, reason });
        }
    }
}

/// Forwards everything read from one client to the loop until EOF or error
///
/// Waits whenever the loop is not taking activity, which stops reading from
/// the socket until it catches up.
async fn read_client<R>(
    client: ClientId,
    mut reader: R,
    activity: mpsc::Sender<ClientActivity>,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let report = match reader.read(&mut buffer).await {
            Ok(0) => {
                let _ = activity.send(ClientActivity::Closed { client }).await;
                return;
            }
            Ok(len) => ClientActivity::Received {
                client,
                bytes: buffer[..len].to_vec(),
            },
            Err(error) => {
                let _ = activity.send(ClientActivity::Failed { client, error }).await;
                return;
            }
        };

        if activity.send(report).await.is_err() {
            return;
        }
    }
}

/// Writes queued messages to one client in order
///
/// Exits after a requested shutdown, when the queue's sender is dropped, or
/// after reporting a write failure to the loop.
async fn write_client<W>(
    client: ClientId,
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    activity: mpsc::Sender<ClientActivity>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let result = match item {
            Outbound::Bytes(bytes) => match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            },
            Outbound::Shutdown => match writer.shutdown().await {
                Ok(()) => {
                    debug!("Sending side of client {} shut down", client);
                    return;
                }
                Err(e) => Err(e),
            },
        };

        if let Err(error) = result {
            let _ = activity.send(ClientActivity::Failed { client, error }).await;
            return;
        }
    }
}
