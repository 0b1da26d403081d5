//! Session connection state machine.
//!
//! `SessionConnection` owns one connection to the evaluation server at a
//! time. Socket I/O runs in a reader task and a writer task per connection;
//! both report back over a channel that the owner drains with
//! [`SessionConnection::process_next`] or [`SessionConnection::poll_events`],
//! so every state change and callback happens on the owner's task.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::response::Response;
use crate::session::framing::{handshake_line, write_line, InboundFraming, InboundSplitter};
use crate::session::transport::{BoxedStream, Connector};

/// How long `connect()` waits for the transport before giving up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closing connection may spend writing out already-sent lines.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Read buffer size; in chunk framing this bounds the size of one unit.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connection state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connect attempt failed. Logged, never returned to callers.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport refused or could not reach the endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    /// The transport did not complete in time.
    #[error("Connection timed out after {0}s")]
    Timeout(u64),
}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        ConnectError::ConnectionFailed(err)
    }
}

/// Called with the new state after every transition.
pub type StateObserver = Box<dyn FnMut(&mut SessionConnection, ConnectionState) + Send>;

/// Called with every decoded inbound unit.
pub type ResponseHandler = Box<dyn FnMut(&mut SessionConnection, &Response) + Send>;

/// Events reported by the I/O tasks.
#[derive(Debug)]
enum Inbound {
    Unit(String),
    Failed(String),
    Closed,
}

/// One live connection: the outbound queue into the writer task plus the
/// liveness flag both I/O tasks clear when the stream dies.
///
/// Dropping the handle aborts both tasks; [`ConnectionHandle::into_drain`]
/// instead lets the writer finish what was already handed to it.
struct ConnectionHandle {
    generation: u64,
    outbound: UnboundedSender<String>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn transmit(&self, text: &str) -> bool {
        self.outbound.send(text.to_string()).is_ok()
    }

    /// Stop reading and close the outbound queue. The returned writer task
    /// writes out what is queued, shuts the stream down and exits.
    fn into_drain(mut self) -> Option<JoinHandle<()>> {
        self.writer.take()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Let a draining writer finish in the background, bounded by
/// [`DRAIN_TIMEOUT`].
fn detach_drain(writer: JoinHandle<()>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        writer.abort();
        return;
    };
    runtime.spawn(async move {
        let abort = writer.abort_handle();
        if timeout(DRAIN_TIMEOUT, writer).await.is_err() {
            warn!("Dropping unsent lines after {:?}", DRAIN_TIMEOUT);
            abort.abort();
        }
    });
}

/// Client side of one evaluation session.
///
/// # Connection Lifecycle
///
/// - `connect()` - open the transport, send the handshake, flush the queue
/// - `send()` - transmit now, or queue until the next successful connect
/// - `process_next()` / `poll_events()` - dispatch inbound responses and closes
/// - `disconnect()` - close the transport; queued text is kept
/// - `close()` - like `disconnect()`, but waits until sent lines are written
///
/// # Example
///
/// ```ignore
/// use evalbridge::session::{SessionConnection, TcpConnector};
///
/// let mut session = SessionConnection::new(Box::new(TcpConnector::new("127.0.0.1", 7878)));
/// session.on_response(|_, response| println!("{}", response.display_text()));
/// session.send("1+1");
/// if session.connect().await {
///     session.process_next().await;
/// }
/// ```
pub struct SessionConnection {
    connector: Box<dyn Connector>,
    framing: InboundFraming,
    session_id: String,
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
    pending: VecDeque<String>,
    generation: u64,
    events_tx: UnboundedSender<(u64, Inbound)>,
    events_rx: UnboundedReceiver<(u64, Inbound)>,
    state_observers: Vec<StateObserver>,
    response_handlers: Vec<ResponseHandler>,
    notifying: bool,
    queued_notifications: VecDeque<ConnectionState>,
    delivering: bool,
    queued_responses: VecDeque<Response>,
}

impl SessionConnection {
    /// Create a disconnected session with a fresh session id.
    pub fn new(connector: Box<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            framing: InboundFraming::default(),
            session_id: Uuid::new_v4().to_string(),
            state: ConnectionState::Disconnected,
            handle: None,
            pending: VecDeque::new(),
            generation: 0,
            events_tx,
            events_rx,
            state_observers: Vec::new(),
            response_handlers: Vec::new(),
            notifying: false,
            queued_notifications: VecDeque::new(),
            delivering: false,
            queued_responses: VecDeque::new(),
        }
    }

    /// Select how inbound bytes are split into units. Applies from the
    /// next connect.
    pub fn with_framing(mut self, framing: InboundFraming) -> Self {
        self.framing = framing;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of payloads waiting for a connection.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True iff the state is `Connected` and the transport is still alive.
    ///
    /// Liveness is read from the handle, so a peer close is visible here
    /// before its close event has been processed.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.handle.as_ref().is_some_and(ConnectionHandle::is_live)
    }

    /// Register a state observer. Observers run in registration order.
    pub fn on_state_change<F>(&mut self, observer: F)
    where
        F: FnMut(&mut SessionConnection, ConnectionState) + Send + 'static,
    {
        self.state_observers.push(Box::new(observer));
    }

    /// Register a response handler. Handlers run in registration order.
    pub fn on_response<F>(&mut self, handler: F)
    where
        F: FnMut(&mut SessionConnection, &Response) + Send + 'static,
    {
        self.response_handlers.push(Box::new(handler));
    }

    /// Connect to the server.
    ///
    /// Resolves `true` once connected (immediately if already connected)
    /// and `false` if the attempt fails or exceeds [`CONNECT_TIMEOUT`].
    pub async fn connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connected if self.is_connected() => return true,
            ConnectionState::Connected => self.reap_dead_handle(),
            ConnectionState::Connecting => {
                // Only reachable when a previous connect future was dropped.
                warn!("Previous connect attempt was abandoned");
                self.transition(ConnectionState::Error);
                return false;
            }
            ConnectionState::Error => {
                self.handle = None;
                self.transition(ConnectionState::Disconnected);
            }
            ConnectionState::Disconnected => {}
        }

        self.transition(ConnectionState::Connecting);
        if self.state != ConnectionState::Connecting {
            debug!("Connect cancelled by observer (state is {})", self.state);
            return false;
        }

        let endpoint = self.connector.endpoint();
        debug!("Connecting to {}", endpoint);

        let attempt = match timeout(CONNECT_TIMEOUT, self.connector.open()).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ConnectError::from(e)),
            // The open future is dropped here, closing any half-open stream.
            Err(_) => Err(ConnectError::Timeout(CONNECT_TIMEOUT.as_secs())),
        };

        match attempt {
            Ok(stream) => {
                self.establish(stream);
                info!("Connected to {} (session {})", endpoint, self.session_id);
                self.transition(ConnectionState::Connected);
                true
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", endpoint, e);
                self.transition(ConnectionState::Error);
                false
            }
        }
    }

    /// Connect with automatic retry and exponential backoff.
    ///
    /// Useful right after starting the server, which may need time before
    /// it accepts connections. Retries with delays of 100ms, 200ms, 400ms, etc.
    pub async fn connect_with_retry(&mut self, max_attempts: u32) -> bool {
        for attempt in 1..=max_attempts {
            if self.connect().await {
                return true;
            }
            if attempt < max_attempts {
                let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(6)));
                debug!("Connect attempt {} failed; retrying in {:?}", attempt, delay);
                tokio::time::sleep(delay).await;
            }
        }
        false
    }

    /// Drop the connection. Queued payloads are kept for the next connect.
    ///
    /// Lines already transmitted are still written out in the background
    /// for up to [`DRAIN_TIMEOUT`]; use [`SessionConnection::close`] to wait
    /// for them.
    pub fn disconnect(&mut self) {
        if let Some(writer) = self.release_handle() {
            detach_drain(writer);
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Disconnect after every transmitted line has been written, or
    /// [`DRAIN_TIMEOUT`] has passed.
    pub async fn close(&mut self) {
        if let Some(writer) = self.release_handle() {
            let abort = writer.abort_handle();
            if timeout(DRAIN_TIMEOUT, writer).await.is_err() {
                warn!("Dropping unsent lines after {:?}", DRAIN_TIMEOUT);
                abort.abort();
            }
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Transmit `text` as one line, or queue it while not connected.
    pub fn send(&mut self, text: impl Into<String>) {
        let text = text.into();

        if self.state == ConnectionState::Connected {
            let sent = self
                .handle
                .as_ref()
                .is_some_and(|handle| handle.is_live() && handle.transmit(&text));
            if sent {
                debug!("Sent {} bytes", text.len() + 1);
                return;
            }
            warn!("Connection lost before send; queueing payload");
            self.reap_dead_handle();
        }

        self.pending.push_back(text);
        debug!("Queued payload ({} pending)", self.pending.len());
    }

    /// Wait for the next inbound event and dispatch it.
    pub async fn process_next(&mut self) {
        // `events_tx` lives in `self`, so the channel never closes.
        if let Some((generation, event)) = self.events_rx.recv().await {
            self.dispatch(generation, event);
        }
    }

    /// Dispatch every inbound event already received, without waiting.
    ///
    /// Returns the number of events handled.
    pub fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((generation, event)) = self.events_rx.try_recv() {
            self.dispatch(generation, event);
            handled += 1;
        }
        handled
    }

    /// Spawn I/O for `stream`, then write the handshake and the queued
    /// payloads ahead of anything observers may send.
    fn establish(&mut self, stream: BoxedStream) {
        self.generation += 1;
        let handle = spawn_io(
            stream,
            self.generation,
            self.framing,
            self.events_tx.clone(),
        );

        handle.transmit(&handshake_line(&self.session_id));
        let flushed = self.pending.len();
        while let Some(text) = self.pending.pop_front() {
            handle.transmit(&text);
        }
        if flushed > 0 {
            debug!("Flushed {} queued payloads", flushed);
        }

        self.handle = Some(handle);
    }

    fn release_handle(&mut self) -> Option<JoinHandle<()>> {
        let handle = self.handle.take()?;
        info!("Disconnected from server");
        handle.into_drain()
    }

    fn reap_dead_handle(&mut self) {
        self.handle = None;
        self.transition(ConnectionState::Disconnected);
    }

    fn dispatch(&mut self, generation: u64, event: Inbound) {
        if self.handle.as_ref().map(|h| h.generation) != Some(generation) {
            debug!("Ignoring {:?} from a closed connection", event);
            return;
        }

        match event {
            Inbound::Unit(text) => match Response::decode(&text) {
                Some(response) => self.deliver(response),
                None => debug!("Discarded blank unit"),
            },
            Inbound::Failed(reason) => {
                error!("Connection error: {}", reason);
                self.transition(ConnectionState::Error);
            }
            Inbound::Closed => {
                info!("Connection closed by server");
                self.handle = None;
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    fn deliver(&mut self, response: Response) {
        debug!("Received {} response", response.kind());
        self.queued_responses.push_back(response);

        // Responses dispatched from inside a handler wait for the current
        // round, like reentrant transitions.
        if self.delivering {
            return;
        }
        self.delivering = true;
        while let Some(next) = self.queued_responses.pop_front() {
            let mut handlers = std::mem::take(&mut self.response_handlers);
            for handler in handlers.iter_mut() {
                handler(self, &next);
            }
            // Keep handlers registered from inside a callback.
            handlers.append(&mut self.response_handlers);
            self.response_handlers = handlers;
        }
        self.delivering = false;
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("Connection state: {} -> {}", self.state, state);
        self.state = state;
        self.queued_notifications.push_back(state);

        // A transition made by an observer is delivered after the current
        // round, so every observer sees every state in order.
        if self.notifying {
            return;
        }
        self.notifying = true;
        while let Some(next) = self.queued_notifications.pop_front() {
            let mut observers = std::mem::take(&mut self.state_observers);
            for observer in observers.iter_mut() {
                observer(self, next);
            }
            observers.append(&mut self.state_observers);
            self.state_observers = observers;
        }
        self.notifying = false;
    }
}

fn spawn_io(
    stream: BoxedStream,
    generation: u64,
    framing: InboundFraming,
    events: UnboundedSender<(u64, Inbound)>,
) -> ConnectionHandle {
    let (read_half, write_half) = tokio::io::split(stream);
    let alive = Arc::new(AtomicBool::new(true));
    let (outbound, outbound_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(read_loop(
        read_half,
        framing,
        generation,
        Arc::clone(&alive),
        events.clone(),
    ));
    let writer = tokio::spawn(write_loop(
        write_half,
        outbound_rx,
        generation,
        Arc::clone(&alive),
        events,
    ));

    ConnectionHandle {
        generation,
        outbound,
        alive,
        reader,
        writer: Some(writer),
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    framing: InboundFraming,
    generation: u64,
    alive: Arc<AtomicBool>,
    events: UnboundedSender<(u64, Inbound)>,
) {
    let mut splitter = InboundSplitter::new(framing);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for unit in splitter.push(&buf[..n]) {
                    let _ = events.send((generation, Inbound::Unit(unit)));
                }
            }
            Err(e) => {
                warn!("Failed to read from server: {}", e);
                alive.store(false, Ordering::SeqCst);
                let _ = events.send((generation, Inbound::Failed(e.to_string())));
                break;
            }
        }
    }

    if let Some(rest) = splitter.finish() {
        let _ = events.send((generation, Inbound::Unit(rest)));
    }
    alive.store(false, Ordering::SeqCst);
    let _ = events.send((generation, Inbound::Closed));
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: UnboundedReceiver<String>,
    generation: u64,
    alive: Arc<AtomicBool>,
    events: UnboundedSender<(u64, Inbound)>,
) {
    while let Some(text) = outbound.recv().await {
        if let Err(e) = write_line(&mut writer, &text).await {
            warn!("Failed to write to server: {:#}", e);
            alive.store(false, Ordering::SeqCst);
            let _ = events.send((generation, Inbound::Failed(format!("{:#}", e))));
            let _ = events.send((generation, Inbound::Closed));
            return;
        }
    }
    let _ = writer.shutdown().await;
}
