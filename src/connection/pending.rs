//! Pending Operations
//!
//! A pending operation is the waiter a dispatch leaves behind while its reply
//! is outstanding. It owns everything needed to emit the terminal event, so
//! the event is produced exactly once no matter who resolves it: the reply
//! router, a transport failure, or a connection-wide teardown. This also holds
//! when the dispatching caller has stopped waiting.

use crate::connection::ServerAddress;
use crate::error::{ConnectionError, Result};
use crate::events::{self, CommandEvent, EventEmitter};
use crate::protocol::{extract_reply, Command, Reply};
use bson::Document;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// Returns the cursor id a reply to `command` may be matched by instead of
/// its request id.
///
/// Only legacy getMore on a transport that correlates by cursor has one. An
/// exhausted cursor (id 0) never does.
pub fn cursor_key(command: &Command, cursor_correlation: bool) -> Option<i64> {
    match command {
        Command::GetMore(get_more) if cursor_correlation && get_more.cursor_id != 0 => {
            Some(get_more.cursor_id)
        }
        _ => None,
    }
}

/// A dispatched command awaiting its outcome.
#[derive(Debug)]
pub(crate) struct PendingOperation {
    request_id: i32,
    cursor_id: Option<i64>,
    command: Arc<Command>,
    started_at: Instant,
    sender: oneshot::Sender<Result<Document>>,
}

/// What resolving an operation produced, for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Succeeded,
    Failed,
}

impl PendingOperation {
    pub(crate) fn new(
        request_id: i32,
        cursor_id: Option<i64>,
        command: Arc<Command>,
        started_at: Instant,
        sender: oneshot::Sender<Result<Document>>,
    ) -> Self {
        Self {
            request_id,
            cursor_id,
            command,
            started_at,
            sender,
        }
    }

    /// Emits the terminal event and hands the outcome to the caller.
    ///
    /// A reply that carries a server failure resolves as `ServerCommand`.
    pub(crate) fn resolve(
        self,
        outcome: Result<Reply>,
        address: &ServerAddress,
        emitter: &EventEmitter,
    ) -> Resolution {
        let outcome = outcome.and_then(|reply| match reply.command_error() {
            Some(error) => Err(error),
            None => Ok(reply),
        });

        let (result, resolution) = match outcome {
            Ok(reply) => {
                emitter.emit(|| {
                    CommandEvent::Succeeded(events::build_succeeded(
                        address,
                        self.request_id,
                        &self.command,
                        &reply,
                        self.started_at,
                    ))
                });
                (Ok(extract_reply(&self.command, &reply)), Resolution::Succeeded)
            }
            Err(error) => {
                emitter.emit(|| {
                    CommandEvent::Failed(events::build_failed(
                        address,
                        self.request_id,
                        &self.command,
                        &error,
                        self.started_at,
                    ))
                });
                (Err(error), Resolution::Failed)
            }
        };

        // The caller may have stopped waiting (socket timeout or a dropped future).
        let _ = self.sender.send(result);
        resolution
    }
}

/// Outstanding operations, keyed by request id.
///
/// Operations with a cursor key are also indexed by cursor id. Both entries
/// are removed together whichever key resolves the operation.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    by_request: HashMap<i32, PendingOperation>,
    by_cursor: HashMap<i64, i32>,
}

impl PendingTable {
    /// Registers `operation`, rejecting a request id or cursor id that is
    /// already in use.
    pub(crate) fn insert(&mut self, operation: PendingOperation) -> Result<()> {
        if self.by_request.contains_key(&operation.request_id) {
            return Err(ConnectionError::protocol(format!(
                "request {} is already pending",
                operation.request_id
            )));
        }
        if let Some(cursor_id) = operation.cursor_id {
            if self.by_cursor.contains_key(&cursor_id) {
                return Err(ConnectionError::protocol(format!(
                    "a getMore is already pending for cursor {}",
                    cursor_id
                )));
            }
            self.by_cursor.insert(cursor_id, operation.request_id);
        }
        self.by_request.insert(operation.request_id, operation);
        Ok(())
    }

    /// Removes the operation sent as `request_id`.
    pub(crate) fn take_request(&mut self, request_id: i32) -> Option<PendingOperation> {
        let operation = self.by_request.remove(&request_id)?;
        if let Some(cursor_id) = operation.cursor_id {
            self.by_cursor.remove(&cursor_id);
        }
        Some(operation)
    }

    /// Removes the operation indexed under `cursor_id`.
    pub(crate) fn take_cursor(&mut self, cursor_id: i64) -> Option<PendingOperation> {
        let request_id = *self.by_cursor.get(&cursor_id)?;
        self.take_request(request_id)
    }

    /// Removes every operation.
    pub(crate) fn drain(&mut self) -> Vec<PendingOperation> {
        self.by_cursor.clear();
        self.by_request.drain().map(|(_, operation)| operation).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_request.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_request.is_empty()
    }
}

/// Fails `error` into every operation, keeping no state.
pub(crate) fn fail_all(
    operations: impl IntoIterator<Item = PendingOperation>,
    error: &ConnectionError,
    address: &ServerAddress,
    emitter: &EventEmitter,
) -> usize {
    let mut failed = 0;
    for operation in operations {
        operation.resolve(Err(error.clone()), address, emitter);
        failed += 1;
    }
    failed
}
