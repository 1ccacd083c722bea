//! Connection Handler
//!
//! `Connection` owns one transport and dispatches commands on it. Many
//! dispatches may be in flight at once; each registers a pending operation and
//! suspends only its own caller.
//!
//! ## Dispatch Flow
//!
//! ```text
//! dispatch(command, options)
//!        │
//!        ▼
//! 1. assign request id (monotonic)
//!        │
//!        ▼
//! 2. register waiter (unless fire-and-forget), emit Started
//!        │
//!        ▼
//! 3. transport.write()
//!        │
//!        ├── no_response ──> resolve on write completion, no terminal event
//!        │
//!        ▼
//! 4. await outcome ──> reply ──> Succeeded (or Failed on ok:0) ──> caller
//!        │          ──> error ──> Failed ──> caller
//!        │
//!        ▼
//! 5. socket timeout elapsed ──> destroy the whole connection:
//!                              every pending waiter fails with Timeout
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!   Open ──close()──> Closing ──(last in-flight op resolved)──> Closed
//!     │                  │                                       ▲
//!     └──────────────────┴── timeout / fatal error / destroy() ──┘
//! ```
//!
//! `Closed` is terminal. The pool watches `subscribe_state()` and replaces
//! closed connections.
//!
//! ## Locking
//!
//! The lifecycle state and the pending table live under one mutex, so
//! registering a waiter, draining the table and the transition to `Closed`
//! are atomic with respect to each other. The lock is never held across an
//! await. Started events are queued inside that critical section and
//! delivered after it, through the emitter's ordered outbox, so a concurrent
//! teardown can never deliver a waiter's Failed event before its Started
//! event. Handlers are never called with the lock held and may query the
//! connection.

use crate::connection::pending::{self, PendingOperation, PendingTable, Resolution};
use crate::connection::transport::{InboundMessage, OutboundMessage, TcpTransport, Transport};
use crate::connection::{ConnectionOptions, DispatchOptions, ServerAddress, StreamDescription};
use crate::error::{ConnectionError, Result};
use crate::events::{self, CommandEvent, EventEmitter};
use crate::protocol::{Command, Reply};
use bson::Document;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// No new dispatches; in-flight operations are allowed to finish
    Closing,
    /// Terminal
    Closed,
}

/// Statistics for one connection
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Commands handed to the transport
    pub commands_dispatched: AtomicU64,
    /// Commands resolved with a reply
    pub commands_succeeded: AtomicU64,
    /// Commands resolved with an error
    pub commands_failed: AtomicU64,
    /// Socket timeouts that tore the connection down
    pub timeouts: AtomicU64,
    /// Replies that matched no pending operation
    pub unmatched_replies: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn resolved(&self, resolution: Resolution) {
        match resolution {
            Resolution::Succeeded => self.commands_succeeded.fetch_add(1, Ordering::Relaxed),
            Resolution::Failed => self.commands_failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// State guarded by the connection mutex.
#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    pending: PendingTable,
}

struct Inner {
    address: ServerAddress,
    id: String,
    description: RwLock<StreamDescription>,
    next_request_id: AtomicI32,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    transport: Arc<dyn Transport>,
    emitter: EventEmitter,
    stats: ConnectionStats,
}

/// A single logical channel to one server.
pub struct Connection {
    inner: Arc<Inner>,
    router: JoinHandle<()>,
}

impl Connection {
    /// Wraps `transport` and starts routing `inbound` replies.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new<T: Transport>(
        transport: T,
        inbound: mpsc::Receiver<InboundMessage>,
        options: ConnectionOptions,
    ) -> Self {
        let description = options.stream_description();
        let emitter = EventEmitter::new(options.event_handlers, options.monitor_commands);
        let (state_tx, _) = watch::channel(ConnectionState::Open);

        let inner = Arc::new(Inner {
            id: events::connection_id(&options.address),
            address: options.address,
            description: RwLock::new(description),
            next_request_id: AtomicI32::new(1),
            shared: Mutex::new(Shared {
                state: ConnectionState::Open,
                pending: PendingTable::default(),
            }),
            state_tx,
            transport: Arc::new(transport),
            emitter,
            stats: ConnectionStats::new(),
        });

        let router = tokio::spawn(route_inbound(Arc::downgrade(&inner), inbound));
        info!(connection = %inner.id, "Connection established");

        Self { inner, router }
    }

    /// Opens a TCP transport to `options.address` and wraps it.
    pub async fn connect(options: ConnectionOptions) -> Result<Self> {
        let (transport, inbound) = TcpTransport::connect(&options.address).await?;
        Ok(Self::new(transport, inbound, options))
    }

    /// Dispatches `command`, resolving exactly once.
    ///
    /// Returns `Ok(None)` for fire-and-forget dispatches and the normalized
    /// reply otherwise.
    pub async fn dispatch(
        &self,
        command: Command,
        options: DispatchOptions,
    ) -> Result<Option<Document>> {
        let inner = &self.inner;
        let request_id = inner.next_request_id();
        let command = Arc::new(command);
        let started_at = Instant::now();

        let receiver = inner.register(request_id, &command, started_at, options.no_response)?;
        inner.stats.command_dispatched();
        trace!(
            connection = %inner.id,
            request_id,
            no_response = options.no_response,
            "Dispatching command"
        );

        let exchange = async {
            let message = OutboundMessage {
                request_id,
                command: &command,
                no_response: options.no_response,
            };

            match inner.transport.write(message).await {
                Ok(written) => inner.stats.bytes_written(written),
                Err(e) => {
                    let error = ConnectionError::from(e);
                    inner.destroy(error.clone());
                    return match receiver {
                        // The waiter was resolved by the teardown.
                        Some(rx) => rx.await.unwrap_or(Err(error)).map(Some),
                        None => Err(error),
                    };
                }
            }

            match receiver {
                None => Ok(None),
                Some(rx) => rx.await.unwrap_or(Err(ConnectionError::Closed)).map(Some),
            }
        };

        match options.socket_timeout {
            None => exchange.await,
            Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        connection = %inner.id,
                        request_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Socket timeout, destroying connection"
                    );
                    inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    let error = ConnectionError::Timeout(timeout);
                    inner.destroy(error.clone());
                    Err(error)
                }
            },
        }
    }

    /// Returns true if sessions may be used on this connection.
    ///
    /// Recomputed from the current stream description on every call, since a
    /// later handshake may change it.
    pub fn has_session_support(&self) -> bool {
        let description = match self.inner.description.read() {
            Ok(description) => *description,
            Err(poisoned) => *poisoned.into_inner(),
        };
        description.load_balanced || description.logical_session_timeout_minutes.is_some()
    }

    /// Applies the outcome of a (re-)handshake.
    pub fn update_stream_description(&self, description: StreamDescription) {
        match self.inner.description.write() {
            Ok(mut current) => *current = description,
            Err(poisoned) => *poisoned.into_inner() = description,
        }
    }

    /// Returns the current stream description.
    pub fn stream_description(&self) -> StreamDescription {
        match self.inner.description.read() {
            Ok(description) => *description,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Stops accepting dispatches and waits for in-flight operations.
    ///
    /// Operations that never complete keep the connection in `Closing`; use
    /// `destroy` to force the teardown.
    pub async fn close(&self) {
        let mut state_rx = self.inner.state_tx.subscribe();
        self.inner.begin_close();
        let _ = state_rx
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Tears the connection down, failing every pending operation with
    /// `Closed`. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy(ConnectionError::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_shared().state
    }

    /// Returns true once the connection can no longer be used.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Subscribes to lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of operations awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_shared().pending.len()
    }

    /// The identity reported as `connectionId` in events.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.inner.stats
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.router.abort();
        self.inner.destroy(ConnectionError::Closed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    /// Returns a fresh request id. Ids run from 1 to `i32::MAX` and then
    /// start over at 1; never zero or negative.
    fn next_request_id(&self) -> i32 {
        self.next_request_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == i32::MAX { 1 } else { id + 1 })
            })
            .unwrap_or_else(|id| id)
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks the connection is open, registers the waiter and queues
    /// Started, all under the connection lock. Started is delivered after the
    /// lock is released.
    fn register(
        &self,
        request_id: i32,
        command: &Arc<Command>,
        started_at: Instant,
        no_response: bool,
    ) -> Result<Option<oneshot::Receiver<Result<Document>>>> {
        let receiver = {
            let mut shared = self.lock_shared();
            if shared.state != ConnectionState::Open {
                return Err(ConnectionError::Closed);
            }

            let receiver = if no_response {
                None
            } else {
                let cursor_id = pending::cursor_key(command, self.transport.cursor_correlation());
                let (tx, rx) = oneshot::channel();
                shared.pending.insert(PendingOperation::new(
                    request_id,
                    cursor_id,
                    Arc::clone(command),
                    started_at,
                    tx,
                ))?;
                Some(rx)
            };

            self.emitter.enqueue(|| {
                CommandEvent::Started(events::build_started(&self.address, request_id, command))
            });
            receiver
        };

        self.emitter.flush();
        Ok(receiver)
    }

    /// Routes one inbound message to its waiter.
    fn route(&self, message: InboundMessage) {
        match message {
            InboundMessage::Reply { response_to, reply } => {
                match self.take_pending(response_to, reply.cursor_id()) {
                    Some(operation) => self.resolve(operation, Ok(reply)),
                    None => {
                        self.stats.unmatched_replies.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            connection = %self.id,
                            response_to,
                            "Reply matched no pending operation"
                        );
                    }
                }
            }
            InboundMessage::Failure { response_to, error } => {
                let fatal = error.is_fatal();
                if let Some(operation) = self.take_pending(response_to, None) {
                    self.resolve(operation, Err(error.clone()));
                }
                if fatal {
                    self.destroy(error);
                }
            }
            InboundMessage::Fatal(error) => {
                self.destroy(error);
            }
        }
    }

    /// Finds the waiter by request id first, then through the cursor index.
    fn take_pending(&self, response_to: i32, cursor_id: Option<i64>) -> Option<PendingOperation> {
        let mut shared = self.lock_shared();
        shared
            .pending
            .take_request(response_to)
            .or_else(|| cursor_id.and_then(|id| shared.pending.take_cursor(id)))
    }

    fn resolve(&self, operation: PendingOperation, outcome: Result<Reply>) {
        let resolution = operation.resolve(outcome, &self.address, &self.emitter);
        self.stats.resolved(resolution);
        self.finish_close_if_drained();
    }

    /// Moves to `Closing`, or straight to `Closed` with nothing in flight.
    fn begin_close(&self) {
        {
            let mut shared = self.lock_shared();
            if shared.state != ConnectionState::Open {
                return;
            }
            shared.state = ConnectionState::Closing;
        }
        self.state_tx.send_replace(ConnectionState::Closing);
        debug!(connection = %self.id, "Connection closing");
        self.finish_close_if_drained();
    }

    fn finish_close_if_drained(&self) {
        {
            let mut shared = self.lock_shared();
            if shared.state != ConnectionState::Closing || !shared.pending.is_empty() {
                return;
            }
            shared.state = ConnectionState::Closed;
        }
        self.transport.shutdown();
        self.state_tx.send_replace(ConnectionState::Closed);
        info!(connection = %self.id, "Connection closed");
    }

    /// Tears the connection down and fails every pending operation with
    /// `error`. Returns false if it was already closed.
    ///
    /// The table is drained in the same critical section as the transition to
    /// `Closed`, so no operation can slip in between.
    fn destroy(&self, error: ConnectionError) -> bool {
        let drained = {
            let mut shared = self.lock_shared();
            if shared.state == ConnectionState::Closed {
                return false;
            }
            shared.state = ConnectionState::Closed;
            shared.pending.drain()
        };

        self.transport.shutdown();
        self.state_tx.send_replace(ConnectionState::Closed);

        let failed = pending::fail_all(
            drained,
            &error,
            &self.address,
            &self.emitter,
        );
        self.stats
            .commands_failed
            .fetch_add(failed as u64, Ordering::Relaxed);

        match error {
            ConnectionError::Closed => {
                info!(connection = %self.id, failed, "Connection destroyed")
            }
            ref e => warn!(connection = %self.id, error = %e, failed, "Connection destroyed"),
        }
        true
    }
}

/// Forwards inbound messages until the transport's channel closes, then
/// destroys the connection.
async fn route_inbound(inner: Weak<Inner>, mut inbound: mpsc::Receiver<InboundMessage>) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.route(message);
    }

    if let Some(inner) = inner.upgrade() {
        inner.destroy(ConnectionError::from(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "transport stream ended",
        )));
    }
}
