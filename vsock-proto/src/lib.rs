//! JSON RPC protocol for host-guest communication over a vsock-multiplexed
//! Unix-domain socket.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte big-endian length][UTF-8 JSON body]
//! ```
//!
//! `length` is the size of the JSON body only. Maximum frame size is
//! [`MAX_FRAME_SIZE`] (10 MiB); larger frames are rejected before any
//! attempt to parse the body.
//!
//! ## Handshake
//!
//! Before the framed conversation begins, the host side of a fresh
//! connection sends a single line `CONNECT <port>\n` and reads a reply
//! line `OK <port>\n` (Firecracker's vsock-over-UDS multiplexing
//! convention); see [`connect_line`] and [`parse_ok_line`].
//!
//! ## Actions
//!
//! Every request is a JSON object tagged by an `action` field
//! (see [`Request`]); every response carries a boolean `success` and
//! either result fields or an `error` string.

mod request;
mod response;

pub use request::Request;
pub use response::{FileEntryWire, MkdirResponse, PingResponse, ReadFileResponse, StatResponse};
pub use response::{DeleteFileResponse, ExecResponse, ListFilesResponse, WriteFileResponse};

/// Length-prefix size.
pub const HEADER_SIZE: usize = 4;

/// Maximum frame size: 10 MiB, per the transport's framing contract.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// The vsock port the guest agent listens on.
pub const GUEST_PORT: u32 = 5000;

#[derive(Debug, Clone)]
pub enum ProtocolError {
    MessageTooLarge(usize),
    Json(String),
    InvalidHandshake(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "message too large: {size} bytes"),
            Self::Json(msg) => write!(f, "malformed JSON frame: {msg}"),
            Self::InvalidHandshake(msg) => write!(f, "invalid handshake: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Build the handshake line a host sends after connecting to `vsock.sock`:
/// `CONNECT <port>\n`.
pub fn connect_line(port: u32) -> String {
    format!("CONNECT {port}\n")
}

/// Parse the guest's handshake reply line. Returns the host port Firecracker
/// assigned on success; any non-`OK` reply is fatal per the transport spec.
pub fn parse_ok_line(line: &str) -> Result<u32, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line
        .strip_prefix("OK ")
        .ok_or_else(|| ProtocolError::InvalidHandshake(line.to_string()))?;
    rest.parse::<u32>()
        .map_err(|_| ProtocolError::InvalidHandshake(line.to_string()))
}

/// Encode a JSON value as one length-prefixed frame.
pub fn encode_frame<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(value).map_err(|e| ProtocolError::Json(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Buffered frame decoder for streaming reads. Yields raw JSON bodies;
/// callers deserialize into [`Request`] or a response type as appropriate.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Feed newly-read bytes and extract complete frame bodies.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let len_bytes: [u8; 4] = match self.buf.get(offset..offset + HEADER_SIZE) {
                Some(s) => match s.try_into() {
                    Ok(a) => a,
                    Err(_) => break,
                },
                None => break,
            };
            let length = u32::from_be_bytes(len_bytes) as usize;

            if length > MAX_FRAME_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooLarge(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let body = self
                .buf
                .get(offset + HEADER_SIZE..offset + total)
                .unwrap_or_default()
                .to_vec();
            frames.push(body);
            offset += total;
        }

        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(frames)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
