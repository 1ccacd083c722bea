//! Connection Module
//!
//! This module manages a single logical channel to one database server.
//! Commands are dispatched on it concurrently and correlated with their
//! replies by request id.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Pool / driver layer                        │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ dispatch(command, options)
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Connection                              │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Normalize + │───>│ Register    │───>│ Transport   │      │
//! │  │ emit Started│    │ waiter      │    │ write       │      │
//! │  └─────────────┘    └──────┬──────┘    └─────────────┘      │
//! │                            │                                │
//! │                            ▼                                │
//! │                   ┌─────────────────┐                       │
//! │                   │ Reply router    │<── inbound replies    │
//! │                   │ (Tokio task)    │                       │
//! │                   └────────┬────────┘                       │
//! │                            ▼                                │
//! │               emit Succeeded / Failed, resolve caller       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Pipelining**: Any number of dispatches in flight per connection
//! - **Fire-and-forget**: `no_response` dispatches resolve on write
//! - **Socket timeouts**: A timeout destroys the whole connection
//! - **Monitoring**: Started/Succeeded/Failed events with redaction
//!
//! ## Example
//!
//! ```ignore
//! use cmdwire::connection::{Connection, ConnectionOptions, DispatchOptions, ServerAddress};
//! use cmdwire::protocol::Command;
//! use bson::doc;
//!
//! let options = ConnectionOptions::new(ServerAddress::new("localhost", 27017));
//! let connection = Connection::connect(options).await?;
//! let reply = connection
//!     .dispatch(Command::modern("admin", doc! { "ping": 1 }), DispatchOptions::default())
//!     .await?;
//! ```

pub mod handler;
pub mod options;
pub mod pending;
pub mod transport;

// Re-export commonly used types
pub use handler::{Connection, ConnectionState, ConnectionStats};
pub use options::{ConnectionOptions, DispatchOptions, ServerAddress, StreamDescription};
pub use pending::cursor_key;
pub use transport::{InboundMessage, OutboundMessage, TcpTransport, Transport};
