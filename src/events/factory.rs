//! Command Event Factory
//!
//! Builds the immutable started/succeeded/failed records for a command. The
//! factory is stateless: it only normalizes, redacts and stamps durations.
//! Whether an event reaches anyone is up to the connection's emitter.
//!
//! ## Redaction
//!
//! Commands carrying credentials never appear verbatim in an event:
//!
//! - Started: the command becomes the name-only marker `{<commandName>: 1}`
//! - Succeeded: the reply becomes `{}`
//! - Failed: the failure becomes `{}`
//!
//! Redaction only touches events. The caller still receives the real reply or
//! error.

use crate::connection::ServerAddress;
use crate::error::ConnectionError;
use crate::events::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent};
use crate::protocol::{extract_command, extract_reply, Command, Reply};
use bson::Document;
use std::time::{Duration, Instant};

/// Commands whose content is never emitted.
pub const SENSITIVE_COMMANDS: [&str; 9] = [
    "authenticate",
    "saslStart",
    "saslContinue",
    "getnonce",
    "createUser",
    "updateUser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// Handshake commands that become sensitive when they carry speculative
/// authentication.
const HELLO_COMMANDS: [&str; 2] = ["hello", "isMaster"];

/// Returns the command name: the first key of a normalized command.
pub fn command_name(command: &Document) -> String {
    command.keys().next().cloned().unwrap_or_default()
}

/// Returns true if events for this command must be redacted.
///
/// Names are matched without regard to ASCII case.
pub fn is_sensitive(name: &str, command: &Document) -> bool {
    if SENSITIVE_COMMANDS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(name))
    {
        return true;
    }

    HELLO_COMMANDS.iter().any(|h| h.eq_ignore_ascii_case(name))
        && command.contains_key("speculativeAuthenticate")
}

/// Returns the stable connection identity reported in events.
pub fn connection_id(connection: &ServerAddress) -> String {
    connection.to_string()
}

/// Builds the started event for `command` dispatched as `request_id`.
pub fn build_started(
    connection: &ServerAddress,
    request_id: i32,
    command: &Command,
) -> CommandStartedEvent {
    let normalized = extract_command(command);
    let name = command_name(&normalized);

    let payload = if is_sensitive(&name, &normalized) {
        let mut marker = Document::new();
        marker.insert(name.as_str(), 1);
        marker
    } else {
        normalized
    };

    CommandStartedEvent {
        command: payload,
        database_name: command.database_name().to_string(),
        command_name: name,
        request_id,
        connection_id: connection_id(connection),
    }
}

/// Builds the succeeded event for `command` answered by `reply`.
pub fn build_succeeded(
    connection: &ServerAddress,
    request_id: i32,
    command: &Command,
    reply: &Reply,
    started_at: Instant,
) -> CommandSucceededEvent {
    let normalized = extract_command(command);
    let name = command_name(&normalized);

    let reply = if is_sensitive(&name, &normalized) {
        Document::new()
    } else {
        extract_reply(command, reply)
    };

    CommandSucceededEvent {
        command_name: name,
        duration: elapsed_since(started_at),
        reply,
        request_id,
        connection_id: connection_id(connection),
    }
}

/// Builds the failed event for `command` resolved with `error`.
pub fn build_failed(
    connection: &ServerAddress,
    request_id: i32,
    command: &Command,
    error: &ConnectionError,
    started_at: Instant,
) -> CommandFailedEvent {
    let normalized = extract_command(command);
    let name = command_name(&normalized);

    let failure = if is_sensitive(&name, &normalized) {
        Document::new()
    } else {
        error.to_failure_document()
    };

    CommandFailedEvent {
        command_name: name,
        duration: elapsed_since(started_at),
        failure,
        request_id,
        connection_id: connection_id(connection),
    }
}

/// Monotonic elapsed time, zero if `started_at` lies in the future.
fn elapsed_since(started_at: Instant) -> Duration {
    Instant::now().saturating_duration_since(started_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CursorBatch, LegacyFind};
    use bson::doc;

    fn address() -> ServerAddress {
        ServerAddress::new("db.example.com", 27017)
    }

    #[test]
    fn test_started_event() {
        let command = Command::modern("test", doc! { "find": "coll", "filter": { "a": 1 } });
        let event = build_started(&address(), 42, &command);

        assert_eq!(event.command, doc! { "find": "coll", "filter": { "a": 1 } });
        assert_eq!(event.database_name, "test");
        assert_eq!(event.command_name, "find");
        assert_eq!(event.request_id, 42);
        assert_eq!(event.connection_id, "db.example.com:27017");
    }

    #[test]
    fn test_started_event_normalizes_legacy_find() {
        let command = Command::LegacyFind(LegacyFind::new("shop.orders", doc! { "$query": { "a": 1 } }));
        let event = build_started(&address(), 1, &command);

        assert_eq!(event.command_name, "find");
        assert_eq!(event.database_name, "shop");
        assert_eq!(event.command, doc! { "find": "orders", "filter": { "a": 1 } });
    }

    #[test]
    fn test_every_sensitive_command_is_redacted() {
        let started_at = Instant::now();
        for name in SENSITIVE_COMMANDS {
            let mut body = Document::new();
            body.insert(name, 1);
            body.insert("payload", "secret-credential");
            let command = Command::modern("admin", body);

            let started = build_started(&address(), 1, &command);
            let mut marker = Document::new();
            marker.insert(name, 1);
            assert_eq!(started.command, marker, "{name}");
            assert_eq!(started.command_name, name);

            let reply = Reply::Document(doc! { "ok": 1, "payload": "server-secret" });
            let succeeded = build_succeeded(&address(), 1, &command, &reply, started_at);
            assert_eq!(succeeded.reply, Document::new(), "{name}");

            let error = ConnectionError::server_command(18, "auth failed", doc! { "ok": 0, "errmsg": "auth failed" });
            let failed = build_failed(&address(), 1, &command, &error, started_at);
            assert_eq!(failed.failure, Document::new(), "{name}");
        }
    }

    #[test]
    fn test_sensitive_match_ignores_case() {
        assert!(is_sensitive("SASLSTART", &Document::new()));
        assert!(is_sensitive("createuser", &Document::new()));
        assert!(!is_sensitive("find", &Document::new()));
    }

    #[test]
    fn test_speculative_hello_is_redacted() {
        let command = Command::modern(
            "admin",
            doc! { "hello": 1, "speculativeAuthenticate": { "mechanism": "SCRAM-SHA-256" } },
        );
        let started = build_started(&address(), 3, &command);
        assert_eq!(started.command, doc! { "hello": 1 });

        let plain = Command::modern("admin", doc! { "hello": 1, "client": {} });
        let started = build_started(&address(), 4, &plain);
        assert_eq!(started.command, doc! { "hello": 1, "client": {} });
    }

    #[test]
    fn test_succeeded_event() {
        let command = Command::get_more("db.coll", 7, 2);
        let reply = Reply::Cursor(CursorBatch {
            cursor_id: 7,
            documents: vec![doc! { "x": 1 }],
        });
        let event = build_succeeded(&address(), 9, &command, &reply, Instant::now());

        assert_eq!(event.command_name, "getMore");
        assert_eq!(event.request_id, 9);
        assert_eq!(
            event.reply,
            doc! { "ok": 1, "cursor": { "id": 7_i64, "ns": "db.coll", "nextBatch": [{ "x": 1 }] } }
        );
    }

    #[test]
    fn test_failed_event_reports_raw_failure() {
        let command = Command::modern("db", doc! { "insert": "coll" });
        let response = doc! { "ok": 0, "errmsg": "duplicate key", "code": 11000 };
        let error = ConnectionError::server_command(11000, "duplicate key", response.clone());

        let event = build_failed(&address(), 5, &command, &error, Instant::now());
        assert_eq!(event.failure, response);
        assert_eq!(event.command_name, "insert");
    }

    #[test]
    fn test_duration_clamped_for_future_start() {
        let command = Command::modern("db", doc! { "ping": 1 });
        let reply = Reply::Document(doc! { "ok": 1 });
        let future = Instant::now() + Duration::from_secs(60);

        let event = build_succeeded(&address(), 1, &command, &reply, future);
        assert_eq!(event.duration, Duration::ZERO);
    }

    #[test]
    fn test_empty_command_has_empty_name() {
        assert_eq!(command_name(&Document::new()), "");
    }
}
