//! Transport Contract
//!
//! A transport owns the byte stream behind a connection. It accepts outbound
//! commands through `Transport::write` and delivers decoded replies through an
//! mpsc channel handed to `Connection::new` alongside it.
//!
//! ```text
//!   Connection ──write()──> Transport ──bytes──> server
//!       ▲                                          │
//!       └──── InboundMessage (mpsc) <── reader <───┘
//! ```
//!
//! Dropping the inbound sender tells the connection the stream has ended.
//!
//! `TcpTransport` is the stock implementation: it sends each command in its
//! canonical form as one OP_MSG and routes replies by `responseTo`.

use crate::error::ConnectionError;
use crate::protocol::frame::{Frame, FrameParser, FLAG_MORE_TO_COME, MAX_MESSAGE_SIZE};
use crate::protocol::{extract_command, Command, Reply};
use crate::connection::ServerAddress;
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Capacity of the inbound reply channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// A command on its way to the wire.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    pub request_id: i32,
    pub command: &'a Command,
    /// The sender will not wait for a reply
    pub no_response: bool,
}

/// Something the transport read off the stream.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// A decoded reply to the request `response_to`
    Reply { response_to: i32, reply: Reply },
    /// The request `response_to` failed; the stream is still usable unless the
    /// error is fatal
    Failure {
        response_to: i32,
        error: ConnectionError,
    },
    /// The stream is broken
    Fatal(ConnectionError),
}

/// The byte stream behind a connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Writes one command, returning the number of bytes written.
    async fn write(&self, message: OutboundMessage<'_>) -> io::Result<usize>;

    /// Tears the stream down. Must be idempotent and safe to call while a
    /// write is in flight.
    fn shutdown(&self);

    /// Returns true if replies to legacy getMore may carry no usable
    /// `responseTo`, so they are also matched by cursor id.
    fn cursor_correlation(&self) -> bool {
        false
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<Option<BufWriter<OwnedWriteHalf>>>>;

/// OP_MSG over TCP.
///
/// `shutdown` closes both halves of the socket: the reader task is aborted
/// and the write half is dropped, which sends FIN to the server. A write in
/// flight observes the closed flag and gives the write half up.
#[derive(Debug)]
pub struct TcpTransport {
    writer: SharedWriter,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: watch::Sender<bool>,
    address: ServerAddress,
}

impl TcpTransport {
    /// Connects to `address` and starts the reply reader.
    pub async fn connect(
        address: &ServerAddress,
    ) -> io::Result<(Self, mpsc::Receiver<InboundMessage>)> {
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        Ok(Self::from_stream(stream, address.clone()))
    }

    /// Wraps an established stream.
    pub fn from_stream(
        stream: TcpStream,
        address: ServerAddress,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(server = %address, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(read_half, tx, address.clone()));

        let (closed, _) = watch::channel(false);

        let transport = Self {
            writer: Arc::new(tokio::sync::Mutex::new(Some(BufWriter::new(write_half)))),
            reader: Mutex::new(Some(reader)),
            closed,
            address,
        };
        (transport, rx)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Drops the write half, or has it dropped once the write holding it lets
    /// go.
    fn release_writer(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
            return;
        }

        let writer = Arc::clone(&self.writer);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    writer.lock().await.take();
                });
            }
            Err(_) => warn!(server = %self.address, "No runtime to release the write half"),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&self, message: OutboundMessage<'_>) -> io::Result<usize> {
        if self.is_closed() {
            return Err(not_connected());
        }

        let mut document = extract_command(message.command);
        document.insert("$db", message.command.database_name());

        let mut frame = Frame::request(message.request_id, document);
        if message.no_response {
            frame.flags |= FLAG_MORE_TO_COME;
        }
        let bytes = frame
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut closed = self.closed.subscribe();
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = closed.wait_for(|closed_now| *closed_now) => return Err(not_connected()),
        };
        let writer = guard.as_mut().ok_or_else(not_connected)?;

        tokio::select! {
            written = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            } => written?,
            _ = closed.wait_for(|closed_now| *closed_now) => return Err(not_connected()),
        }
        drop(guard);
        trace!(
            server = %self.address,
            request_id = message.request_id,
            bytes = bytes.len(),
            "Wrote command"
        );
        Ok(bytes.len())
    }

    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
        self.release_writer();
        debug!(server = %self.address, "Transport shut down");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads frames until the stream ends, forwarding each as a reply.
async fn read_loop(
    mut stream: OwnedReadHalf,
    tx: mpsc::Sender<InboundMessage>,
    address: ServerAddress,
) {
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    let mut parser = FrameParser::new();

    loop {
        loop {
            match parser.parse(&buffer) {
                Ok(Some((frame, consumed))) => {
                    let _ = buffer.split_to(consumed);
                    let message = InboundMessage::Reply {
                        response_to: frame.response_to,
                        reply: Reply::Document(frame.document),
                    };
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(server = %address, error = %e, "Corrupt reply stream");
                    let _ = tx.send(InboundMessage::Fatal(e.into())).await;
                    return;
                }
            }
        }

        if buffer.len() >= MAX_MESSAGE_SIZE {
            let _ = tx
                .send(InboundMessage::Fatal(ConnectionError::Protocol {
                    message: "read buffer limit exceeded".to_string(),
                    fatal: true,
                }))
                .await;
            return;
        }

        if buffer.capacity() - buffer.len() < 1024 {
            buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        match stream.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!(server = %address, "Server closed the stream");
                return;
            }
            Ok(n) => trace!(server = %address, bytes = n, "Read data"),
            Err(e) => {
                let _ = tx.send(InboundMessage::Fatal(e.into())).await;
                return;
            }
        }
    }
}
