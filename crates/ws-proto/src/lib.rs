// ws-proto: RFC 6455 frame model shared by the dispatch engine and its
// transports.
//
// The engine never touches wire bytes.  The framing collaborator parses the
// wire and hands over whole `Frame`s; outbound traffic flows back as `Frame`s
// plus close requests.  This crate is the vocabulary of that seam.

use thiserror::Error;

/// Largest allowed payload of a control frame (close/ping/pong).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest allowed close reason, leaving two bytes for the status code.
pub const MAX_CLOSE_REASON: usize = 123;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Frame operation codes as defined by RFC 6455.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation frame of a fragmented message (0x0).
    Continuation,
    /// Text data frame (0x1).
    Text,
    /// Binary data frame (0x2).
    Binary,
    /// Close control frame (0x8).
    Close,
    /// Ping control frame (0x9).
    Ping,
    /// Pong control frame (0xA).
    Pong,
    /// Reserved or unknown opcode; always a protocol violation.
    Bad(u8),
}

impl OpCode {
    /// Whether this opcode denotes a control frame.
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Whether this opcode starts or continues a data message.
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        match byte {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Bad(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Bad(other) => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A single WebSocket frame, already stripped of wire-level framing.
///
/// `payload` is unmasked; masking is the framing collaborator's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub fin: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final text frame.
    pub fn text(payload: impl Into<String>) -> Self {
        Frame {
            opcode: OpCode::Text,
            fin: true,
            payload: payload.into().into_bytes(),
        }
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            opcode: OpCode::Binary,
            fin: true,
            payload: payload.into(),
        }
    }

    /// A continuation frame; `fin` marks the last fragment.
    pub fn continuation(payload: impl Into<Vec<u8>>, fin: bool) -> Self {
        Frame {
            opcode: OpCode::Continuation,
            fin,
            payload: payload.into(),
        }
    }

    /// A ping frame carrying application data.
    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            opcode: OpCode::Ping,
            fin: true,
            payload: payload.into(),
        }
    }

    /// A pong frame carrying application data.
    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            opcode: OpCode::Pong,
            fin: true,
            payload: payload.into(),
        }
    }

    /// A close frame for the given reason.
    ///
    /// The reason text is truncated to [`MAX_CLOSE_REASON`] bytes on a char
    /// boundary before encoding.
    pub fn close(reason: &CloseReason) -> Self {
        Frame {
            opcode: OpCode::Close,
            fin: true,
            payload: encode_close_payload(reason),
        }
    }

    /// Validate the RFC 6455 control-frame rules for this frame.
    ///
    /// Control frames must not be fragmented and must carry at most
    /// [`MAX_CONTROL_PAYLOAD`] bytes.  Data frames always pass.
    pub fn check_control_rules(&self) -> Result<(), FrameError> {
        if !self.opcode.is_control() {
            return Ok(());
        }
        if !self.fin {
            return Err(FrameError::FragmentedControlFrame(self.opcode));
        }
        if self.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlPayloadTooLarge(self.payload.len()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Close codes and reasons
// ---------------------------------------------------------------------------

/// Close status codes used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal,
    /// 1001: endpoint going away (server shutdown, endpoint disposed).
    Away,
    /// 1002: protocol error.
    Protocol,
    /// 1003: unsupported data.
    Unsupported,
    /// 1006: abnormal closure; never sent on the wire, only reported.
    Abnormal,
    /// 1007: payload inconsistent with message type (bad UTF-8).
    Invalid,
    /// 1009: message too big for the configured buffer.
    Size,
    /// 1011: unexpected server-side error.
    Error,
    /// Any other registered or application code.
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1009 => CloseCode::Size,
            1011 => CloseCode::Error,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Size => 1009,
            CloseCode::Error => 1011,
            CloseCode::Other(other) => other,
        }
    }
}

/// Why a connection closed (or is being asked to close).
///
/// Delivered to close callbacks and accepted by the session close surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        CloseReason {
            code,
            reason: reason.into(),
        }
    }

    /// 1000 with an empty reason.
    pub fn normal() -> Self {
        CloseReason::new(CloseCode::Normal, "")
    }
}

/// Faults in a frame the framing collaborator handed over.
///
/// All of these are protocol violations; the dispatcher answers them with a
/// 1002 close.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("control frame {0:?} must not be fragmented")]
    FragmentedControlFrame(OpCode),
    #[error("control frame payload is {0} bytes, limit is {MAX_CONTROL_PAYLOAD}")]
    ControlPayloadTooLarge(usize),
    #[error("close frame payload of a single byte")]
    TruncatedClosePayload,
    #[error("close reason is not valid UTF-8")]
    InvalidCloseReason,
}

/// Encode a close reason into a close-frame payload.
///
/// An empty reason with code 1000 still encodes the status code; the peer is
/// entitled to see what it is being closed with.
pub fn encode_close_payload(reason: &CloseReason) -> Vec<u8> {
    let code: u16 = reason.code.into();
    let text = truncate_reason(&reason.reason);
    let mut payload = Vec::with_capacity(2 + text.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(text.as_bytes());
    payload
}

/// Parse a close-frame payload into a close reason.
///
/// An empty payload means the peer sent no status code; RFC 6455 reads that
/// as a normal closure.  A single-byte payload is malformed.
pub fn parse_close_payload(payload: &[u8]) -> Result<CloseReason, FrameError> {
    match payload.len() {
        0 => Ok(CloseReason::normal()),
        1 => Err(FrameError::TruncatedClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| FrameError::InvalidCloseReason)?;
            Ok(CloseReason::new(CloseCode::from(code), reason))
        }
    }
}

/// Truncate a close reason to [`MAX_CLOSE_REASON`] bytes on a char boundary.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
