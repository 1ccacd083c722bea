//! Command and Reply Types
//!
//! This module defines the command shapes a connection can dispatch and the
//! reply shapes it can receive back.
//!
//! ## Command Shapes
//!
//! Four distinct encodings reach the connection layer:
//!
//! - `Modern`: an already-canonical command document (`{find: "coll", ...}`)
//! - `GetMore`: a legacy cursor continuation (OP_GET_MORE)
//! - `KillCursors`: a legacy cursor release (OP_KILL_CURSORS)
//! - `LegacyFind`: an OP_QUERY message; either a `$query`-wrapped find, or a
//!   plain command wrapped in a query
//!
//! A `Command` is immutable once built. The request id is not part of the
//! command: the connection assigns it when the command is dispatched.
//!
//! ## Reply Shapes
//!
//! Modern commands answer with one result document. Legacy cursor operations
//! answer with cursor-shaped fields (cursor id plus a document batch).

use crate::error::ConnectionError;
use bson::{Bson, Document};
use std::fmt;

/// The collection name used by command namespaces (`admin.$cmd`).
pub const COMMAND_COLLECTION: &str = "$cmd";

/// A `database.collection` identifier.
///
/// The database is everything before the first dot; the collection is the
/// rest, so collection names may themselves contain dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    /// Creates a namespace from its two segments.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parses a `database.collection` string.
    ///
    /// A string without a dot is treated as a database-only namespace with an
    /// empty collection segment.
    pub fn parse(ns: &str) -> Self {
        match ns.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Self::new(ns, ""),
        }
    }

    /// Returns the command namespace (`<db>.$cmd`) for a database.
    pub fn command(db: impl Into<String>) -> Self {
        Self::new(db, COMMAND_COLLECTION)
    }

    /// Returns true if this is a `<db>.$cmd` namespace.
    pub fn is_command(&self) -> bool {
        self.coll == COMMAND_COLLECTION
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl From<&str> for Namespace {
    fn from(ns: &str) -> Self {
        Namespace::parse(ns)
    }
}

/// OP_QUERY wire flags that carry over to the canonical find command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags {
    pub tailable: bool,
    pub oplog_replay: bool,
    pub no_cursor_timeout: bool,
    pub await_data: bool,
    pub partial: bool,
    pub exhaust: bool,
}

impl QueryFlags {
    /// Returns `(canonical name, value)` pairs in canonical order.
    pub fn entries(&self) -> [(&'static str, bool); 6] {
        [
            ("tailable", self.tailable),
            ("oplogReplay", self.oplog_replay),
            ("noCursorTimeout", self.no_cursor_timeout),
            ("awaitData", self.await_data),
            ("partial", self.partial),
            ("exhaust", self.exhaust),
        ]
    }
}

/// Legacy OP_QUERY options that sit beside the query document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyFindOptions {
    pub number_to_skip: Option<i32>,
    pub number_to_return: Option<i32>,
    pub return_fields_selector: Option<Document>,
}

/// An already-canonical command document addressed to a namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct ModernCommand {
    pub namespace: Namespace,
    pub document: Document,
}

/// A legacy cursor continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMore {
    pub namespace: Namespace,
    pub cursor_id: i64,
    pub number_to_return: i32,
}

/// A legacy request to release server-side cursors.
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursors {
    pub namespace: Namespace,
    pub cursor_ids: Vec<i64>,
}

/// An OP_QUERY message.
///
/// When `query` carries a `$query` key this is a legacy find whose body is
/// wrapped together with `$`-prefixed modifiers. Otherwise `query` is itself a
/// command sent over the legacy opcode.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyFind {
    pub namespace: Namespace,
    pub query: Document,
    pub options: LegacyFindOptions,
    pub flags: QueryFlags,
    /// Limit as sent by servers older than 3.2.
    pub pre32_limit: Option<i32>,
}

impl LegacyFind {
    /// Creates a query message with default options and flags.
    pub fn new(namespace: impl Into<Namespace>, query: Document) -> Self {
        Self {
            namespace: namespace.into(),
            query,
            options: LegacyFindOptions::default(),
            flags: QueryFlags::default(),
            pre32_limit: None,
        }
    }

    /// Returns true if the query document uses the `$query` wrapper.
    pub fn is_wrapped_find(&self) -> bool {
        self.query.contains_key("$query")
    }
}

/// A command as handed to the connection layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Modern(ModernCommand),
    GetMore(GetMore),
    KillCursors(KillCursors),
    LegacyFind(LegacyFind),
}

impl Command {
    /// Creates a modern command addressed to `<db>.$cmd`.
    pub fn modern(db: impl Into<String>, document: Document) -> Self {
        Command::Modern(ModernCommand {
            namespace: Namespace::command(db),
            document,
        })
    }

    /// Creates a legacy getMore.
    pub fn get_more(namespace: impl Into<Namespace>, cursor_id: i64, number_to_return: i32) -> Self {
        Command::GetMore(GetMore {
            namespace: namespace.into(),
            cursor_id,
            number_to_return,
        })
    }

    /// Creates a legacy killCursors.
    pub fn kill_cursors(namespace: impl Into<Namespace>, cursor_ids: Vec<i64>) -> Self {
        Command::KillCursors(KillCursors {
            namespace: namespace.into(),
            cursor_ids,
        })
    }

    /// Returns the namespace the command is addressed to.
    pub fn namespace(&self) -> &Namespace {
        match self {
            Command::Modern(c) => &c.namespace,
            Command::GetMore(c) => &c.namespace,
            Command::KillCursors(c) => &c.namespace,
            Command::LegacyFind(c) => &c.namespace,
        }
    }

    /// Returns the target database (first namespace segment).
    pub fn database_name(&self) -> &str {
        &self.namespace().db
    }
}

/// Cursor-shaped reply fields for legacy cursor operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorBatch {
    pub cursor_id: i64,
    pub documents: Vec<Document>,
}

/// A decoded reply delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A modern command result document.
    Document(Document),
    /// A legacy cursor batch.
    Cursor(CursorBatch),
}

impl Reply {
    /// Returns the cursor id for cursor-shaped replies.
    pub fn cursor_id(&self) -> Option<i64> {
        match self {
            Reply::Cursor(batch) => Some(batch.cursor_id),
            Reply::Document(_) => None,
        }
    }

    /// Returns the generic result document.
    ///
    /// A cursor batch answering a plain command sent over the legacy query
    /// opcode carries the command's result as its first document; an empty
    /// batch yields an empty document.
    pub fn result_document(&self) -> Document {
        match self {
            Reply::Document(doc) => doc.clone(),
            Reply::Cursor(batch) => batch.documents.first().cloned().unwrap_or_default(),
        }
    }

    /// Returns the server-reported failure carried by this reply, if any.
    ///
    /// A result document fails when `ok` is numerically zero or when it carries
    /// a legacy `$err` field. A cursor batch fails when its first document
    /// carries `$err` (the legacy query-failure reply).
    pub fn command_error(&self) -> Option<ConnectionError> {
        let doc = match self {
            Reply::Document(doc) => doc,
            Reply::Cursor(batch) => batch.documents.first()?,
        };

        if let Ok(message) = doc.get_str("$err") {
            return Some(ConnectionError::server_command(
                error_code(doc),
                message,
                doc.clone(),
            ));
        }

        match doc.get("ok").and_then(bson_number) {
            Some(ok) if ok == 0.0 => Some(ConnectionError::server_command(
                error_code(doc),
                doc.get_str("errmsg").unwrap_or("command failed"),
                doc.clone(),
            )),
            _ => None,
        }
    }
}

/// Converts a document batch into a BSON array.
pub(crate) fn documents_to_bson(documents: &[Document]) -> Bson {
    Bson::Array(documents.iter().cloned().map(Bson::Document).collect())
}

/// Reads any numeric BSON value as `f64`.
pub(crate) fn bson_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        Bson::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn error_code(doc: &Document) -> i32 {
    doc.get("code")
        .and_then(bson_number)
        .map(|n| n as i32)
        .unwrap_or(0)
}
