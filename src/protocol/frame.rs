//! OP_MSG Framing
//!
//! This module implements the minimal wire framing the TCP transport needs:
//! one OP_MSG per command, carrying a single body section (kind 0).
//!
//! ## Frame Layout
//!
//! ```text
//! ┌──────────────┬────────────┬─────────────┬──────────┐
//! │ messageLength│ requestID  │ responseTo  │ opCode   │  16-byte header,
//! │ i32 LE       │ i32 LE     │ i32 LE      │ 2013     │  little endian
//! ├──────────────┴────────────┴─────────────┴──────────┤
//! │ flagBits u32 LE                                    │
//! ├────────────────────────────────────────────────────┤
//! │ section kind 0x00 │ BSON document                  │
//! ├────────────────────────────────────────────────────┤
//! │ optional CRC-32C checksum (flag bit 0)             │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! ## How the Parser Works
//!
//! Like a stream parser over a growing buffer, `FrameParser::parse` returns:
//! - `Ok(Some((frame, consumed)))` - a complete frame, `consumed` bytes used
//! - `Ok(None)` - the frame is incomplete, read more data
//! - `Err(FrameError)` - the stream is corrupt and must be dropped

use bson::Document;
use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Size of the standard message header.
pub const HEADER_LEN: usize = 16;

/// The OP_MSG opcode.
pub const OP_MSG: i32 = 2013;

/// Largest message a server accepts by default (48 MB).
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Flag bit: a CRC-32C checksum trails the message.
pub const FLAG_CHECKSUM_PRESENT: u32 = 1 << 0;

/// Flag bit: the sender will not wait for a reply.
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    /// Declared length is smaller than a minimal message
    #[error("invalid message length: {0}")]
    InvalidLength(i32),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Opcode other than OP_MSG
    #[error("unsupported opcode: {0}")]
    UnsupportedOpcode(i32),

    /// Section kind other than a body section
    #[error("unsupported section kind: {0:#04x}")]
    UnsupportedSection(u8),

    /// The body is not a valid BSON document
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// Result type for frame decoding.
pub type FrameResult<T> = Result<T, FrameError>;

/// One OP_MSG message with a single body document.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: u32,
    pub document: Document,
}

impl Frame {
    /// Creates a request frame.
    pub fn request(request_id: i32, document: Document) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: 0,
            document,
        }
    }

    /// Returns true if the sender does not expect a reply.
    pub fn more_to_come(&self) -> bool {
        self.flags & FLAG_MORE_TO_COME != 0
    }

    /// Serializes the frame into `buf`. Checksums are never written.
    pub fn encode_into(&self, buf: &mut BytesMut) -> FrameResult<()> {
        let mut body = Vec::new();
        self.document
            .to_writer(&mut body)
            .map_err(|e| FrameError::InvalidDocument(e.to_string()))?;

        let total = HEADER_LEN + 4 + 1 + body.len();
        if total > MAX_MESSAGE_SIZE {
            return Err(FrameError::MessageTooLarge {
                size: total,
                max: MAX_MESSAGE_SIZE,
            });
        }

        buf.reserve(total);
        buf.put_i32_le(total as i32);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(OP_MSG);
        buf.put_u32_le(self.flags & !FLAG_CHECKSUM_PRESENT);
        buf.put_u8(0);
        buf.put_slice(&body);
        Ok(())
    }

    /// Serializes the frame into a fresh buffer.
    pub fn encode(&self) -> FrameResult<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }
}

/// An incremental OP_MSG decoder.
#[derive(Debug, Default)]
pub struct FrameParser;

impl FrameParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self
    }

    /// Attempts to decode one frame from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> FrameResult<Option<(Frame, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let declared = read_i32(buf, 0);
        if declared < (HEADER_LEN + 5) as i32 {
            return Err(FrameError::InvalidLength(declared));
        }
        let len = declared as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(FrameError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if buf.len() < len {
            return Ok(None);
        }

        let request_id = read_i32(buf, 4);
        let response_to = read_i32(buf, 8);
        let opcode = read_i32(buf, 12);
        if opcode != OP_MSG {
            return Err(FrameError::UnsupportedOpcode(opcode));
        }

        let flags = read_i32(buf, 16) as u32;
        let kind = buf[20];
        if kind != 0 {
            return Err(FrameError::UnsupportedSection(kind));
        }

        let mut end = len;
        if flags & FLAG_CHECKSUM_PRESENT != 0 {
            end = end.saturating_sub(4);
        }
        if end <= HEADER_LEN + 5 {
            return Err(FrameError::InvalidLength(declared));
        }

        let mut body = &buf[HEADER_LEN + 5..end];
        let document = Document::from_reader(&mut body)
            .map_err(|e| FrameError::InvalidDocument(e.to_string()))?;

        Ok(Some((
            Frame {
                request_id,
                response_to,
                flags,
                document,
            },
            len,
        )))
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
