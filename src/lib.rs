//! # cmdwire - Per-Connection Command Dispatch for a Document Database Driver
//!
//! cmdwire is the command-execution layer of a database driver's connection
//! subsystem. It dispatches commands on a single connection, normalizes
//! legacy and modern command shapes into one canonical form for monitoring,
//! redacts sensitive commands, and tears connections down on socket timeouts.
//!
//! ## Features
//!
//! - **Canonical Commands**: Legacy OP_QUERY finds, getMore and killCursors are
//!   translated to the modern command shape
//! - **Command Monitoring**: Started/Succeeded/Failed events with a fixed field set
//! - **Redaction**: Authentication and user-management commands never leak
//!   into events
//! - **Pipelining**: Many in-flight commands per connection, correlated by
//!   request id
//! - **Async I/O**: Built on Tokio
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              cmdwire                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Caller     │───>│ Connection  │───>│  Transport  │───> server       │
//! │  │  (pool)     │    │  dispatch   │    │  (OP_MSG)   │                  │
//! │  └─────────────┘    └──────┬──────┘    └─────────────┘                  │
//! │                            │                                            │
//! │              ┌─────────────┴─────────────┐                              │
//! │              ▼                           ▼                              │
//! │  ┌──────────────────────┐   ┌──────────────────────────┐                │
//! │  │  CommandTranslator   │   │   CommandEventFactory    │──> handlers    │
//! │  │  (pure, canonical)   │   │   (redaction, duration)  │                │
//! │  └──────────────────────┘   └──────────────────────────┘                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use cmdwire::connection::{Connection, ConnectionOptions, DispatchOptions, ServerAddress};
//! use cmdwire::events::TracingEventHandler;
//! use cmdwire::protocol::Command;
//! use bson::doc;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = ConnectionOptions::new(ServerAddress::new("localhost", 27017))
//!         .with_event_handler(Arc::new(TracingEventHandler));
//!     let connection = Connection::connect(options).await?;
//!
//!     let reply = connection
//!         .dispatch(
//!             Command::modern("admin", doc! { "ping": 1 }),
//!             DispatchOptions::default().with_socket_timeout(Duration::from_secs(5)),
//!         )
//!         .await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: Command/reply shapes, the translator and OP_MSG framing
//! - [`events`]: Command monitoring events, the event factory and handlers
//! - [`connection`]: The connection, its options and the transport contract
//! - [`error`]: The connection error taxonomy
//!
//! ## Design Highlights
//!
//! ### Whole-Connection Timeouts
//!
//! The protocol has no per-operation cancellation. When one dispatch's socket
//! timeout elapses the transport is destroyed, and every other pending
//! operation on the connection fails with the same timeout at the same moment.
//!
//! ### Exactly One Terminal Event
//!
//! Each waiter owns the context for its terminal event, so a command that was
//! started always ends with exactly one Succeeded or Failed event, whether it
//! was resolved by a reply, a transport failure or a teardown.

pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;

// Re-export commonly used types for convenience
pub use connection::{
    Connection, ConnectionOptions, ConnectionState, DispatchOptions, ServerAddress,
    StreamDescription, Transport,
};
pub use error::ConnectionError;
pub use events::{CommandEvent, CommandEventHandler, TracingEventHandler};
pub use protocol::{extract_command, extract_reply, Command, Reply};

/// Version of cmdwire
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
