//! Relay wire protocol framing.
//!
//! Every message is a big-endian tag followed by fixed fields and, where
//! applicable, a length-prefixed array:
//!
//! ```text
//! CONNECT            tag(2) | token length(4) | token
//! CONNECT_SUCCESS    tag(2) | sid length(4)   | sid
//! RECONNECT_SUCCESS  tag(2) | ack(4)
//! DATA               tag(2) | sequence(4) | payload length(4) | payload
//! ACK                tag(2) | sequence(4)
//! CLOSE              tag(2) | close code(4) | reason length(4) | reason
//! ```
//!
//! The numeric tag and close-code values are relay-service-defined constants
//! and are kept in this module only; they must be validated against the
//! relay deployment during integration testing.

use crate::error::{CoreError, CoreErrorKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload carried by a single DATA frame. Defined as 16K by the
/// relay protocol; the sender must pre-chunk, the codec rejects larger
/// payloads instead of splitting them.
pub const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Maximum length of the variable-size arrays (token, sid, close reason).
pub const MAX_ARRAY_LENGTH: usize = MAX_DATA_CHUNK;

const TAG_CONNECT_SUCCESS: u16 = 0x0001;
const TAG_RECONNECT_SUCCESS: u16 = 0x0002;
const TAG_CONNECT: u16 = 0x0003;
const TAG_DATA: u16 = 0x0004;
const TAG_ACK: u16 = 0x0007;
const TAG_CLOSE: u16 = 0x0009;

const TAG_LENGTH: usize = 2;
const DATA_HEADER_LENGTH: usize = TAG_LENGTH + 4 + 4;
const CLOSE_HEADER_LENGTH: usize = TAG_LENGTH + 4 + 4;
const ARRAY_HEADER_LENGTH: usize = TAG_LENGTH + 4;

/// Close codes the relay may send in a CLOSE frame (or as the status of a
/// transport-level close). Service-defined values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    NotAuthorized,
    SidUnknown,
    SidInUse,
    FailedToRewind,
    BackendConnectFailed,
    LookupFailed,
    Other(u32),
}

impl CloseCode {
    pub fn to_wire(self) -> u32 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::NotAuthorized => 4033,
            CloseCode::SidUnknown => 4051,
            CloseCode::SidInUse => 4052,
            CloseCode::FailedToRewind => 4053,
            CloseCode::BackendConnectFailed => 4061,
            CloseCode::LookupFailed => 4062,
            CloseCode::Other(code) => code,
        }
    }

    pub fn from_wire(code: u32) -> Self {
        match code {
            1000 => CloseCode::Normal,
            4033 => CloseCode::NotAuthorized,
            4051 => CloseCode::SidUnknown,
            4052 => CloseCode::SidInUse,
            4053 => CloseCode::FailedToRewind,
            4061 => CloseCode::BackendConnectFailed,
            4062 => CloseCode::LookupFailed,
            other => CloseCode::Other(other),
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCode::Normal => write!(f, "normal closure"),
            CloseCode::NotAuthorized => write!(f, "not authorized"),
            CloseCode::SidUnknown => write!(f, "session id unknown"),
            CloseCode::SidInUse => write!(f, "session id in use"),
            CloseCode::FailedToRewind => write!(f, "failed to rewind"),
            CloseCode::BackendConnectFailed => write!(f, "backend connect failed"),
            CloseCode::LookupFailed => write!(f, "backend lookup failed"),
            CloseCode::Other(code) => write!(f, "close code {code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Connect { token: String },
    ConnectSuccess { sid: String },
    ReconnectSuccess { ack: u32 },
    Data { sequence: u32, payload: Bytes },
    Ack { sequence: u32 },
    Close { code: CloseCode, reason: String },
}

impl RelayFrame {
    /// Initial client frame; the token must be non-empty.
    pub fn connect(token: &str) -> Result<Self, CoreError> {
        if token.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::EncodingError,
                "connect token must not be empty",
            ));
        }
        if token.len() > MAX_ARRAY_LENGTH {
            return Err(CoreError::new(
                CoreErrorKind::FrameTooLarge,
                "connect token exceeds the maximum array length",
            ));
        }
        Ok(RelayFrame::Connect {
            token: token.to_owned(),
        })
    }

    /// Data frame; the payload must be 1..=[`MAX_DATA_CHUNK`] bytes.
    pub fn data(sequence: u32, payload: Bytes) -> Result<Self, CoreError> {
        if payload.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::EncodingError,
                "at least one byte must be sent at once",
            ));
        }
        if payload.len() > MAX_DATA_CHUNK {
            return Err(CoreError::new(
                CoreErrorKind::FrameTooLarge,
                "payload exceeds the maximum chunk size",
            ));
        }
        Ok(RelayFrame::Data { sequence, payload })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelayFrame::Connect { .. } => "CONNECT",
            RelayFrame::ConnectSuccess { .. } => "CONNECT_SUCCESS",
            RelayFrame::ReconnectSuccess { .. } => "RECONNECT_SUCCESS",
            RelayFrame::Data { .. } => "DATA",
            RelayFrame::Ack { .. } => "ACK",
            RelayFrame::Close { .. } => "CLOSE",
        }
    }
}

/// Wrapping "is newer" comparison for u32 sequence numbers. A sequence is
/// newer than another when it lies in the half-window ahead of it, so the
/// comparison stays correct across the wrap boundary.
pub fn seq_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

#[derive(Debug, Default)]
pub struct RelayFrameCodec;

impl RelayFrameCodec {
    pub fn new() -> Self {
        Self
    }
}

fn peek_u16(src: &BytesMut, at: usize) -> u16 {
    u16::from_be_bytes([src[at], src[at + 1]])
}

fn peek_u32(src: &BytesMut, at: usize) -> u32 {
    u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

fn decode_string(bytes: Bytes, what: &str) -> Result<String, CoreError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        CoreError::new(
            CoreErrorKind::MalformedFrame,
            format!("{what} is not valid UTF-8").as_str(),
        )
    })
}

impl Encoder<RelayFrame> for RelayFrameCodec {
    type Error = CoreError;

    fn encode(&mut self, frame: RelayFrame, dst: &mut BytesMut) -> Result<(), CoreError> {
        match frame {
            RelayFrame::Connect { token } => {
                if token.is_empty() {
                    return Err(CoreError::new(
                        CoreErrorKind::EncodingError,
                        "connect token must not be empty",
                    ));
                }
                if token.len() > MAX_ARRAY_LENGTH {
                    return Err(CoreError::new(
                        CoreErrorKind::FrameTooLarge,
                        "connect token exceeds the maximum array length",
                    ));
                }
                dst.reserve(ARRAY_HEADER_LENGTH + token.len());
                dst.put_u16(TAG_CONNECT);
                dst.put_u32(token.len() as u32);
                dst.put_slice(token.as_bytes());
            }
            RelayFrame::ConnectSuccess { sid } => {
                if sid.is_empty() {
                    return Err(CoreError::new(
                        CoreErrorKind::EncodingError,
                        "session id must not be empty",
                    ));
                }
                if sid.len() > MAX_ARRAY_LENGTH {
                    return Err(CoreError::new(
                        CoreErrorKind::FrameTooLarge,
                        "session id exceeds the maximum array length",
                    ));
                }
                dst.reserve(ARRAY_HEADER_LENGTH + sid.len());
                dst.put_u16(TAG_CONNECT_SUCCESS);
                dst.put_u32(sid.len() as u32);
                dst.put_slice(sid.as_bytes());
            }
            RelayFrame::ReconnectSuccess { ack } => {
                dst.reserve(TAG_LENGTH + 4);
                dst.put_u16(TAG_RECONNECT_SUCCESS);
                dst.put_u32(ack);
            }
            RelayFrame::Data { sequence, payload } => {
                if payload.is_empty() {
                    return Err(CoreError::new(
                        CoreErrorKind::EncodingError,
                        "at least one byte must be sent at once",
                    ));
                }
                if payload.len() > MAX_DATA_CHUNK {
                    return Err(CoreError::new(
                        CoreErrorKind::FrameTooLarge,
                        "payload exceeds the maximum chunk size",
                    ));
                }
                dst.reserve(DATA_HEADER_LENGTH + payload.len());
                dst.put_u16(TAG_DATA);
                dst.put_u32(sequence);
                dst.put_u32(payload.len() as u32);
                dst.put_slice(payload.as_ref());
            }
            RelayFrame::Ack { sequence } => {
                dst.reserve(TAG_LENGTH + 4);
                dst.put_u16(TAG_ACK);
                dst.put_u32(sequence);
            }
            RelayFrame::Close { code, reason } => {
                if reason.len() > MAX_ARRAY_LENGTH {
                    return Err(CoreError::new(
                        CoreErrorKind::FrameTooLarge,
                        "close reason exceeds the maximum array length",
                    ));
                }
                dst.reserve(CLOSE_HEADER_LENGTH + reason.len());
                dst.put_u16(TAG_CLOSE);
                dst.put_u32(code.to_wire());
                dst.put_u32(reason.len() as u32);
                dst.put_slice(reason.as_bytes());
            }
        }
        Ok(())
    }
}

impl Decoder for RelayFrameCodec {
    type Item = RelayFrame;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RelayFrame>, CoreError> {
        if src.len() < TAG_LENGTH {
            return Ok(None);
        }
        let tag = peek_u16(src, 0);
        match tag {
            TAG_CONNECT | TAG_CONNECT_SUCCESS => {
                if src.len() < ARRAY_HEADER_LENGTH {
                    return Ok(None);
                }
                let length = peek_u32(src, TAG_LENGTH) as usize;
                if length > MAX_ARRAY_LENGTH {
                    return Err(CoreError::new(
                        CoreErrorKind::MalformedFrame,
                        "declared array length exceeds the maximum",
                    ));
                }
                if src.len() < ARRAY_HEADER_LENGTH + length {
                    return Ok(None);
                }
                src.advance(ARRAY_HEADER_LENGTH);
                let value = src.split_to(length).freeze();
                let frame = if tag == TAG_CONNECT {
                    RelayFrame::Connect {
                        token: decode_string(value, "connect token")?,
                    }
                } else {
                    RelayFrame::ConnectSuccess {
                        sid: decode_string(value, "session id")?,
                    }
                };
                Ok(Some(frame))
            }
            TAG_RECONNECT_SUCCESS => {
                if src.len() < TAG_LENGTH + 4 {
                    return Ok(None);
                }
                let ack = peek_u32(src, TAG_LENGTH);
                src.advance(TAG_LENGTH + 4);
                Ok(Some(RelayFrame::ReconnectSuccess { ack }))
            }
            TAG_DATA => {
                if src.len() < DATA_HEADER_LENGTH {
                    return Ok(None);
                }
                let sequence = peek_u32(src, TAG_LENGTH);
                let length = peek_u32(src, TAG_LENGTH + 4) as usize;
                if length == 0 || length > MAX_DATA_CHUNK {
                    return Err(CoreError::new(
                        CoreErrorKind::MalformedFrame,
                        "declared payload length is out of range",
                    ));
                }
                if src.len() < DATA_HEADER_LENGTH + length {
                    return Ok(None);
                }
                src.advance(DATA_HEADER_LENGTH);
                let payload = src.split_to(length).freeze();
                Ok(Some(RelayFrame::Data { sequence, payload }))
            }
            TAG_ACK => {
                if src.len() < TAG_LENGTH + 4 {
                    return Ok(None);
                }
                let sequence = peek_u32(src, TAG_LENGTH);
                src.advance(TAG_LENGTH + 4);
                Ok(Some(RelayFrame::Ack { sequence }))
            }
            TAG_CLOSE => {
                if src.len() < CLOSE_HEADER_LENGTH {
                    return Ok(None);
                }
                let code = peek_u32(src, TAG_LENGTH);
                let length = peek_u32(src, TAG_LENGTH + 4) as usize;
                if length > MAX_ARRAY_LENGTH {
                    return Err(CoreError::new(
                        CoreErrorKind::MalformedFrame,
                        "declared reason length exceeds the maximum",
                    ));
                }
                if src.len() < CLOSE_HEADER_LENGTH + length {
                    return Ok(None);
                }
                src.advance(CLOSE_HEADER_LENGTH);
                let reason = decode_string(src.split_to(length).freeze(), "close reason")?;
                Ok(Some(RelayFrame::Close {
                    code: CloseCode::from_wire(code),
                    reason,
                }))
            }
            unknown => Err(CoreError::new(
                CoreErrorKind::MalformedFrame,
                format!("unknown frame tag 0x{unknown:04x}").as_str(),
            )),
        }
    }
}
