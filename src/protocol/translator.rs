//! Command Translator
//!
//! Maps every supported command and reply shape onto one canonical document
//! shape. The canonical form is what monitoring sees, and it is also a valid
//! modern command, so the TCP transport can send it as-is.
//!
//! ## Translation Rules
//!
//! ```text
//! GetMore      ──> { getMore: <id>, collection: <coll>, batchSize: <n> }
//! KillCursors  ──> { killCursors: <coll>, cursors: [<id>, ...] }
//! LegacyFind   ──> { find: <coll>, filter: ..., sort: ..., skip: ..., ... }
//!   ($query)        wrapped as { explain: {...} } when $explain is set
//! LegacyFind   ──> the query document itself
//!   (no $query)
//! Modern       ──> unchanged
//! ```
//!
//! Both functions are pure: they never mutate their input and always produce
//! the same fields in the same order. Field order matters because the first
//! key of the result is taken as the command name.

use crate::protocol::types::{documents_to_bson, Command, LegacyFind, Reply};
use bson::{Bson, Document};

/// `$`-prefixed query modifiers and their canonical find field names.
pub const LEGACY_FIND_QUERY_MAP: [(&str, &str); 11] = [
    ("$query", "filter"),
    ("$orderby", "sort"),
    ("$hint", "hint"),
    ("$comment", "comment"),
    ("$maxScan", "maxScan"),
    ("$max", "max"),
    ("$min", "min"),
    ("$returnKey", "returnKey"),
    ("$showDiskLoc", "showRecordId"),
    ("$maxTimeMS", "maxTimeMS"),
    ("$snapshot", "snapshot"),
];

/// Legacy OP_QUERY option names and their canonical find field names.
pub const LEGACY_FIND_OPTIONS_MAP: [(&str, &str); 3] = [
    ("numberToSkip", "skip"),
    ("numberToReturn", "batchSize"),
    ("returnFieldsSelector", "projection"),
];

/// Key marking a legacy find as an explain request.
const EXPLAIN_MARKER: &str = "$explain";

/// Returns the canonical command document for `command`.
pub fn extract_command(command: &Command) -> Document {
    match command {
        Command::GetMore(get_more) => {
            let mut doc = Document::new();
            doc.insert("getMore", get_more.cursor_id);
            doc.insert("collection", get_more.namespace.coll.as_str());
            doc.insert("batchSize", get_more.number_to_return);
            doc
        }
        Command::KillCursors(kill) => {
            let mut doc = Document::new();
            doc.insert("killCursors", kill.namespace.coll.as_str());
            doc.insert(
                "cursors",
                Bson::Array(kill.cursor_ids.iter().copied().map(Bson::Int64).collect()),
            );
            doc
        }
        Command::LegacyFind(find) if find.is_wrapped_find() => upconvert_find(find),
        Command::LegacyFind(find) => find.query.clone(),
        Command::Modern(modern) => modern.document.clone(),
    }
}

/// Returns the canonical reply document for `reply` to `command`.
///
/// A cursor-shaped command answered with a plain result document (a server
/// speaking the modern protocol) yields that document unchanged.
pub fn extract_reply(command: &Command, reply: &Reply) -> Document {
    match (command, reply) {
        (Command::GetMore(get_more), Reply::Cursor(batch)) => {
            cursor_reply(batch.cursor_id, &get_more.namespace.to_string(), "nextBatch", &batch.documents)
        }
        (Command::KillCursors(kill), _) => {
            let mut doc = Document::new();
            doc.insert("ok", 1);
            doc.insert(
                "cursorsUnknown",
                Bson::Array(kill.cursor_ids.iter().copied().map(Bson::Int64).collect()),
            );
            doc
        }
        (Command::LegacyFind(find), Reply::Cursor(batch)) if find.is_wrapped_find() => {
            cursor_reply(batch.cursor_id, &find.namespace.to_string(), "firstBatch", &batch.documents)
        }
        _ => reply.result_document(),
    }
}

/// Builds a canonical find from a `$query`-wrapped OP_QUERY.
///
/// A wrapped query addressed to a `$cmd` namespace is a legacy command: its
/// `$query` body is upconverted verbatim instead of becoming a find.
fn upconvert_find(find: &LegacyFind) -> Document {
    let mut result = if find.namespace.is_command() {
        match find.query.get_document("$query") {
            Ok(body) => body.clone(),
            Err(_) => Document::new(),
        }
    } else {
        let mut result = Document::new();
        result.insert("find", find.namespace.coll.as_str());
        for (legacy, canonical) in LEGACY_FIND_QUERY_MAP {
            if let Some(value) = find.query.get(legacy) {
                result.insert(canonical, value.clone());
            }
        }
        result
    };

    let options = &find.options;
    let option_values: [Option<Bson>; 3] = [
        options.number_to_skip.map(Bson::Int32),
        options.number_to_return.map(Bson::Int32),
        options.return_fields_selector.clone().map(Bson::Document),
    ];
    for ((_, canonical), value) in LEGACY_FIND_OPTIONS_MAP.iter().zip(option_values) {
        if let Some(value) = value {
            result.insert(*canonical, value);
        }
    }

    for (flag, set) in find.flags.entries() {
        if set {
            result.insert(flag, true);
        }
    }

    if let Some(limit) = find.pre32_limit {
        result.insert("limit", limit);
    }

    if is_truthy(find.query.get(EXPLAIN_MARKER)) {
        let mut explain = Document::new();
        explain.insert("explain", result);
        return explain;
    }

    result
}

fn cursor_reply(cursor_id: i64, ns: &str, batch_field: &str, documents: &[Document]) -> Document {
    let mut cursor = Document::new();
    cursor.insert("id", cursor_id);
    cursor.insert("ns", ns);
    cursor.insert(batch_field, documents_to_bson(documents));

    let mut doc = Document::new();
    doc.insert("ok", 1);
    doc.insert("cursor", cursor);
    doc
}

fn is_truthy(value: Option<&Bson>) -> bool {
    match value {
        None | Some(Bson::Null) | Some(Bson::Undefined) => false,
        Some(Bson::Boolean(b)) => *b,
        Some(Bson::Int32(n)) => *n != 0,
        Some(Bson::Int64(n)) => *n != 0,
        Some(Bson::Double(n)) => *n != 0.0,
        Some(Bson::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{CursorBatch, LegacyFindOptions, QueryFlags};
    use bson::doc;

    fn legacy_find() -> Command {
        let mut find = LegacyFind::new(
            "db.coll",
            doc! { "$query": { "a": 1 }, "$orderby": { "b": 1 } },
        );
        find.options = LegacyFindOptions {
            number_to_skip: Some(5),
            number_to_return: Some(10),
            return_fields_selector: None,
        };
        Command::LegacyFind(find)
    }

    #[test]
    fn test_legacy_find() {
        assert_eq!(
            extract_command(&legacy_find()),
            doc! { "find": "coll", "filter": { "a": 1 }, "sort": { "b": 1 }, "skip": 5, "batchSize": 10 }
        );
    }

    #[test]
    fn test_legacy_find_field_order() {
        let doc = extract_command(&legacy_find());
        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["find", "filter", "sort", "skip", "batchSize"]);
    }

    #[test]
    fn test_legacy_find_all_modifiers() {
        let find = LegacyFind::new(
            "db.coll",
            doc! {
                "$query": {},
                "$hint": "a_1",
                "$comment": "c",
                "$maxScan": 10,
                "$max": { "a": 9 },
                "$min": { "a": 1 },
                "$returnKey": true,
                "$showDiskLoc": true,
                "$maxTimeMS": 100,
                "$snapshot": true,
                "$unknown": 1,
            },
        );
        let result = extract_command(&Command::LegacyFind(find));
        assert_eq!(
            result,
            doc! {
                "find": "coll",
                "filter": {},
                "hint": "a_1",
                "comment": "c",
                "maxScan": 10,
                "max": { "a": 9 },
                "min": { "a": 1 },
                "returnKey": true,
                "showRecordId": true,
                "maxTimeMS": 100,
                "snapshot": true,
            }
        );
    }

    #[test]
    fn test_legacy_find_flags_projection_and_limit() {
        let mut find = LegacyFind::new("db.coll", doc! { "$query": { "a": 1 } });
        find.options.return_fields_selector = Some(doc! { "a": 1 });
        find.flags = QueryFlags {
            tailable: true,
            await_data: true,
            ..Default::default()
        };
        find.pre32_limit = Some(3);

        assert_eq!(
            extract_command(&Command::LegacyFind(find)),
            doc! {
                "find": "coll",
                "filter": { "a": 1 },
                "projection": { "a": 1 },
                "tailable": true,
                "awaitData": true,
                "limit": 3,
            }
        );
    }

    #[test]
    fn test_legacy_find_explain() {
        let find = LegacyFind::new("db.coll", doc! { "$query": { "a": 1 }, "$explain": true });
        assert_eq!(
            extract_command(&Command::LegacyFind(find)),
            doc! { "explain": { "find": "coll", "filter": { "a": 1 } } }
        );
    }

    #[test]
    fn test_legacy_command_upconvert() {
        let mut find = LegacyFind::new(
            "admin.$cmd",
            doc! { "$query": { "ismaster": 1 }, "$readPreference": { "mode": "primary" } },
        );
        find.options.number_to_return = Some(-1);
        assert_eq!(
            extract_command(&Command::LegacyFind(find)),
            doc! { "ismaster": 1, "batchSize": -1 }
        );
    }

    #[test]
    fn test_plain_query_is_unwrapped() {
        let find = LegacyFind::new("admin.$cmd", doc! { "ismaster": 1, "client": { "app": "x" } });
        assert_eq!(
            extract_command(&Command::LegacyFind(find)),
            doc! { "ismaster": 1, "client": { "app": "x" } }
        );
    }

    #[test]
    fn test_get_more() {
        let command = Command::get_more("db.coll", 123, 50);
        assert_eq!(
            extract_command(&command),
            doc! { "getMore": 123_i64, "collection": "coll", "batchSize": 50 }
        );
    }

    #[test]
    fn test_kill_cursors() {
        let command = Command::kill_cursors("db.coll", vec![1, 2]);
        assert_eq!(
            extract_command(&command),
            doc! { "killCursors": "coll", "cursors": [1_i64, 2_i64] }
        );
    }

    #[test]
    fn test_modern_passes_through() {
        let command = Command::modern("db", doc! { "insert": "coll", "documents": [{ "a": 1 }] });
        assert_eq!(
            extract_command(&command),
            doc! { "insert": "coll", "documents": [{ "a": 1 }] }
        );
    }

    #[test]
    fn test_extract_command_is_pure() {
        let command = legacy_find();
        let before = command.clone();

        let first = extract_command(&command);
        let second = extract_command(&command);

        assert_eq!(first, second);
        assert_eq!(command, before);
    }

    #[test]
    fn test_get_more_reply() {
        let command = Command::get_more("db.coll", 123, 50);
        let reply = Reply::Cursor(CursorBatch {
            cursor_id: 123,
            documents: vec![doc! { "x": 1 }, doc! { "x": 2 }],
        });
        assert_eq!(
            extract_reply(&command, &reply),
            doc! { "ok": 1, "cursor": { "id": 123_i64, "ns": "db.coll", "nextBatch": [{ "x": 1 }, { "x": 2 }] } }
        );
    }

    #[test]
    fn test_kill_cursors_reply() {
        let command = Command::kill_cursors("db.coll", vec![1, 2]);
        let reply = Reply::Document(doc! {});
        assert_eq!(
            extract_reply(&command, &reply),
            doc! { "ok": 1, "cursorsUnknown": [1_i64, 2_i64] }
        );
    }

    #[test]
    fn test_legacy_find_reply() {
        let reply = Reply::Cursor(CursorBatch {
            cursor_id: 0,
            documents: vec![doc! { "a": 1 }],
        });
        assert_eq!(
            extract_reply(&legacy_find(), &reply),
            doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.coll", "firstBatch": [{ "a": 1 }] } }
        );
    }

    #[test]
    fn test_legacy_command_reply_is_first_document() {
        let command = Command::LegacyFind(LegacyFind::new("admin.$cmd", doc! { "ismaster": 1 }));
        let reply = Reply::Cursor(CursorBatch {
            cursor_id: 0,
            documents: vec![doc! { "ismaster": true, "maxWireVersion": 5, "ok": 1.0 }],
        });
        assert_eq!(
            extract_reply(&command, &reply),
            doc! { "ismaster": true, "maxWireVersion": 5, "ok": 1.0 }
        );
    }

    #[test]
    fn test_modern_reply_unchanged() {
        let command = Command::modern("db", doc! { "ping": 1 });
        let reply = Reply::Document(doc! { "ok": 1.0, "extra": "x" });
        assert_eq!(extract_reply(&command, &reply), doc! { "ok": 1.0, "extra": "x" });
    }

    #[test]
    fn test_cursor_command_with_document_reply() {
        let command = Command::get_more("db.coll", 5, 10);
        let reply = Reply::Document(doc! { "ok": 1, "cursor": { "id": 0_i64, "nextBatch": [] } });
        assert_eq!(
            extract_reply(&command, &reply),
            doc! { "ok": 1, "cursor": { "id": 0_i64, "nextBatch": [] } }
        );
    }
}
