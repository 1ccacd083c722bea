//! Command Monitoring Events
//!
//! Every command dispatched on a connection that awaits a reply produces one
//! `CommandStartedEvent` and exactly one terminal event, either
//! `CommandSucceededEvent` or `CommandFailedEvent`, correlated by request id.
//!
//! ## Field Sets
//!
//! The serialized field names are a compatibility contract with monitoring
//! tooling and conformance test collectors:
//!
//! ```text
//! Started    command, databaseName, commandName, requestId, connectionId
//! Succeeded  commandName, duration, reply, requestId, connectionId
//! Failed     commandName, duration, failure, requestId, connectionId
//! ```
//!
//! `duration` serializes as whole milliseconds.
//!
//! ## Subscribers
//!
//! Handlers implement `CommandEventHandler`. An unbounded mpsc sender is a
//! handler too, which is the easiest way to collect events in tests.

pub mod factory;

pub use factory::{
    build_failed, build_started, build_succeeded, command_name, connection_id, is_sensitive,
    SENSITIVE_COMMANDS,
};

use bson::Document;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Emitted when a command is written to a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStartedEvent {
    pub command: Document,
    pub database_name: String,
    pub command_name: String,
    pub request_id: i32,
    pub connection_id: String,
}

/// Emitted when a command completes successfully.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSucceededEvent {
    pub command_name: String,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    pub reply: Document,
    pub request_id: i32,
    pub connection_id: String,
}

/// Emitted when a command fails, including every pending command failed by a
/// connection teardown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailedEvent {
    pub command_name: String,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    pub failure: Document,
    pub request_id: i32,
    pub connection_id: String,
}

/// Any command monitoring event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

impl CommandEvent {
    /// Returns the request id shared by a started event and its terminal event.
    pub fn request_id(&self) -> i32 {
        match self {
            CommandEvent::Started(e) => e.request_id,
            CommandEvent::Succeeded(e) => e.request_id,
            CommandEvent::Failed(e) => e.request_id,
        }
    }

    /// Returns the name of the command the event describes.
    pub fn command_name(&self) -> &str {
        match self {
            CommandEvent::Started(e) => &e.command_name,
            CommandEvent::Succeeded(e) => &e.command_name,
            CommandEvent::Failed(e) => &e.command_name,
        }
    }

    /// Returns true for succeeded and failed events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandEvent::Started(_))
    }
}

fn serialize_duration_ms<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

/// A subscriber to command monitoring events.
pub trait CommandEventHandler: Send + Sync {
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}

    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}

    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}

impl CommandEventHandler for mpsc::UnboundedSender<CommandEvent> {
    fn handle_command_started_event(&self, event: CommandStartedEvent) {
        let _ = self.send(CommandEvent::Started(event));
    }

    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {
        let _ = self.send(CommandEvent::Succeeded(event));
    }

    fn handle_command_failed_event(&self, event: CommandFailedEvent) {
        let _ = self.send(CommandEvent::Failed(event));
    }
}

/// Logs every command event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventHandler;

impl CommandEventHandler for TracingEventHandler {
    fn handle_command_started_event(&self, event: CommandStartedEvent) {
        debug!(
            connection = %event.connection_id,
            request_id = event.request_id,
            db = %event.database_name,
            command = %event.command_name,
            "Command started"
        );
    }

    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {
        debug!(
            connection = %event.connection_id,
            request_id = event.request_id,
            command = %event.command_name,
            duration_ms = event.duration.as_millis() as u64,
            "Command succeeded"
        );
    }

    fn handle_command_failed_event(&self, event: CommandFailedEvent) {
        warn!(
            connection = %event.connection_id,
            request_id = event.request_id,
            command = %event.command_name,
            duration_ms = event.duration.as_millis() as u64,
            failure = %event.failure,
            "Command failed"
        );
    }
}

/// Fans events out to the configured handlers.
///
/// Events are built lazily, so a disabled emitter never pays for translation
/// or redaction.
///
/// Events pass through an ordered outbox. `enqueue` may be called while the
/// caller holds its own locks; `flush` delivers outside them. Only one thread
/// delivers at a time and it keeps draining until the outbox is empty, so
/// events reach handlers in enqueue order, and a handler may call back into
/// the connection (its nested events are delivered by the outer flush).
#[derive(Default)]
pub struct EventEmitter {
    handlers: Vec<Arc<dyn CommandEventHandler>>,
    enabled: bool,
    outbox: Mutex<VecDeque<CommandEvent>>,
    delivering: Mutex<()>,
}

impl EventEmitter {
    /// Creates an emitter. Nothing is emitted unless `enabled` is set and at
    /// least one handler is present.
    pub fn new(handlers: Vec<Arc<dyn CommandEventHandler>>, enabled: bool) -> Self {
        Self {
            handlers,
            enabled,
            ..Default::default()
        }
    }

    /// Returns true if events will reach at least one handler.
    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.handlers.is_empty()
    }

    /// Builds the event with `make` and delivers it to every handler.
    pub fn emit(&self, make: impl FnOnce() -> CommandEvent) {
        self.enqueue(make);
        self.flush();
    }

    /// Builds the event with `make` and queues it without delivering.
    pub fn enqueue(&self, make: impl FnOnce() -> CommandEvent) {
        if !self.is_enabled() {
            return;
        }
        let event = make();
        lock(&self.outbox).push_back(event);
    }

    /// Delivers queued events in order.
    pub fn flush(&self) {
        loop {
            let delivering = match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // Another thread is delivering and will pick our events up.
                Err(TryLockError::WouldBlock) => return,
            };

            loop {
                let next = lock(&self.outbox).pop_front();
                match next {
                    Some(event) => self.deliver(event),
                    None => break,
                }
            }

            drop(delivering);
            if lock(&self.outbox).is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, event: CommandEvent) {
        for handler in &self.handlers {
            match event.clone() {
                CommandEvent::Started(e) => handler.handle_command_started_event(e),
                CommandEvent::Succeeded(e) => handler.handle_command_succeeded_event(e),
                CommandEvent::Failed(e) => handler.handle_command_failed_event(e),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("handlers", &self.handlers.len())
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn started() -> CommandEvent {
        CommandEvent::Started(CommandStartedEvent {
            command: doc! { "ping": 1 },
            database_name: "admin".to_string(),
            command_name: "ping".to_string(),
            request_id: 4,
            connection_id: "localhost:27017".to_string(),
        })
    }

    #[test]
    fn test_started_field_names() {
        let CommandEvent::Started(event) = started() else {
            unreachable!()
        };
        let doc = bson::to_document(&event).unwrap();
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["command", "databaseName", "commandName", "requestId", "connectionId"]
        );
    }

    #[test]
    fn test_terminal_field_names() {
        let succeeded = CommandSucceededEvent {
            command_name: "ping".to_string(),
            duration: Duration::from_millis(12),
            reply: doc! { "ok": 1 },
            request_id: 4,
            connection_id: "localhost:27017".to_string(),
        };
        let doc = bson::to_document(&succeeded).unwrap();
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["commandName", "duration", "reply", "requestId", "connectionId"]
        );
        assert_eq!(doc.get_i64("duration").unwrap(), 12);

        let failed = CommandFailedEvent {
            command_name: "ping".to_string(),
            duration: Duration::ZERO,
            failure: doc! {},
            request_id: 4,
            connection_id: "localhost:27017".to_string(),
        };
        let doc = bson::to_document(&failed).unwrap();
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["commandName", "duration", "failure", "requestId", "connectionId"]
        );
    }

    #[test]
    fn test_emitter_delivers_to_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel::<CommandEvent>();
        let handler: Arc<dyn CommandEventHandler> = Arc::new(tx);
        let emitter = EventEmitter::new(vec![handler], true);

        emitter.emit(started);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.request_id(), 4);
        assert_eq!(event.command_name(), "ping");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_disabled_emitter_never_builds() {
        let (tx, mut rx) = mpsc::unbounded_channel::<CommandEvent>();
        let handler: Arc<dyn CommandEventHandler> = Arc::new(tx);
        let emitter = EventEmitter::new(vec![handler], false);

        emitter.emit(|| panic!("event built while monitoring is disabled"));

        assert!(rx.try_recv().is_err());
        assert!(!EventEmitter::default().is_enabled());
    }

    #[test]
    fn test_enqueued_events_wait_for_flush() {
        let (tx, mut rx) = mpsc::unbounded_channel::<CommandEvent>();
        let handler: Arc<dyn CommandEventHandler> = Arc::new(tx);
        let emitter = EventEmitter::new(vec![handler], true);

        emitter.enqueue(started);
        assert!(rx.try_recv().is_err());

        emitter.emit(started);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    /// Emits a second event from inside the first one's delivery.
    struct Reentrant {
        emitter: std::sync::OnceLock<std::sync::Weak<EventEmitter>>,
        seen: Mutex<Vec<i32>>,
    }

    impl CommandEventHandler for Reentrant {
        fn handle_command_started_event(&self, event: CommandStartedEvent) {
            lock(&self.seen).push(event.request_id);
            if event.request_id == 4 {
                if let Some(emitter) = self.emitter.get().and_then(|e| e.upgrade()) {
                    emitter.emit(|| {
                        let CommandEvent::Started(mut nested) = started() else {
                            unreachable!()
                        };
                        nested.request_id = 5;
                        CommandEvent::Started(nested)
                    });
                    // Not delivered yet: the outer flush owns delivery.
                    assert_eq!(*lock(&self.seen), vec![4]);
                }
            }
        }
    }

    #[test]
    fn test_reentrant_emit_is_delivered_in_order() {
        let reentrant = Arc::new(Reentrant {
            emitter: std::sync::OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn CommandEventHandler> = reentrant.clone();
        let emitter = Arc::new(EventEmitter::new(vec![handler], true));
        let _ = reentrant.emitter.set(Arc::downgrade(&emitter));

        emitter.emit(started);

        assert_eq!(*lock(&reentrant.seen), vec![4, 5]);
    }
}
