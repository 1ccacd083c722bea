//! Command Protocol
//!
//! This module holds the command and reply shapes a connection works with,
//! the translator that normalizes them, and the OP_MSG framing used by the
//! TCP transport.
//!
//! ## Modules
//!
//! - `types`: The closed `Command` union and the `Reply` shapes
//! - `translator`: Pure legacy-to-canonical command and reply mapping
//! - `frame`: Incremental OP_MSG encoder/decoder
//!
//! ## Example
//!
//! ```
//! use cmdwire::protocol::{extract_command, Command};
//! use bson::doc;
//!
//! let command = Command::get_more("db.coll", 123, 50);
//! assert_eq!(
//!     extract_command(&command),
//!     doc! { "getMore": 123_i64, "collection": "coll", "batchSize": 50 }
//! );
//! ```

pub mod frame;
pub mod translator;
pub mod types;

// Re-export commonly used types for convenience
pub use frame::{Frame, FrameError, FrameParser, FrameResult};
pub use translator::{extract_command, extract_reply};
pub use types::{
    Command, CursorBatch, GetMore, KillCursors, LegacyFind, LegacyFindOptions, ModernCommand,
    Namespace, QueryFlags, Reply,
};
