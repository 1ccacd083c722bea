//! Connection and Dispatch Options
//!
//! Plain configuration structs handed over by the pool (`ConnectionOptions`)
//! and by callers of `Connection::dispatch` (`DispatchOptions`).

use crate::events::CommandEventHandler;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The default server port.
pub const DEFAULT_PORT: u16 = 27017;

/// The host and port a connection targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host` or `host:port`, falling back to the default port.
    pub fn parse(address: &str) -> Result<Self, String> {
        match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| format!("invalid port in address: {}", address))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(address, DEFAULT_PORT)),
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Handshake-derived facts about the stream. A later handshake may replace
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamDescription {
    /// Server-advertised logical session timeout
    pub logical_session_timeout_minutes: Option<u32>,
    /// Whether the connection goes through a load balancer
    pub load_balanced: bool,
}

/// Everything the pool supplies when it creates a connection.
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    pub address: ServerAddress,
    pub logical_session_timeout_minutes: Option<u32>,
    pub load_balanced: bool,
    /// Emit command monitoring events
    pub monitor_commands: bool,
    pub event_handlers: Vec<Arc<dyn CommandEventHandler>>,
}

impl ConnectionOptions {
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Enables monitoring and subscribes `handler`.
    pub fn with_event_handler(mut self, handler: Arc<dyn CommandEventHandler>) -> Self {
        self.monitor_commands = true;
        self.event_handlers.push(handler);
        self
    }

    pub(crate) fn stream_description(&self) -> StreamDescription {
        StreamDescription {
            logical_session_timeout_minutes: self.logical_session_timeout_minutes,
            load_balanced: self.load_balanced,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("address", &self.address)
            .field(
                "logical_session_timeout_minutes",
                &self.logical_session_timeout_minutes,
            )
            .field("load_balanced", &self.load_balanced)
            .field("monitor_commands", &self.monitor_commands)
            .field("event_handlers", &self.event_handlers.len())
            .finish()
    }
}

/// Per-dispatch options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Fire-and-forget: resolve once the write completes, never await a reply
    pub no_response: bool,
    /// Tear the connection down if no outcome arrives within this window
    pub socket_timeout: Option<Duration>,
}

impl DispatchOptions {
    pub fn fire_and_forget() -> Self {
        Self {
            no_response: true,
            socket_timeout: None,
        }
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }
}
