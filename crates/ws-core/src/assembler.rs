//! Per-connection reassembly of fragmented data frames.
//!
//! Control frames never reach the assembler.  Whole-delivery callbacks get
//! their message only once the FIN fragment arrives and the accumulated
//! payload passes the per-kind size cap (and UTF-8 validation for text).
//! Partial-delivery callbacks get each fragment as it arrives, with the FIN
//! bit passed through; the assembler then only tracks which kind is in
//! flight so continuations stay attributable.

use ws_proto::OpCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    pub(crate) fn word(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Binary => "binary",
        }
    }
}

/// What a data frame produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Assembled {
    /// Fragment buffered; nothing to dispatch yet.
    Pending,
    /// A whole text message.
    Text(String),
    /// A whole binary message.
    Binary(Vec<u8>),
    /// A text fragment for a partial-delivery callback.
    TextFragment { data: String, last: bool },
    /// A binary fragment for a partial-delivery callback.
    BinaryFragment { data: Vec<u8>, last: bool },
}

/// Why assembly failed; the dispatcher maps these onto close codes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AssemblyError {
    /// 1002.
    Protocol(&'static str),
    /// 1009.
    Overflow { kind: MessageKind, limit: usize },
    /// 1007.
    InvalidUtf8,
}

/// Per-connection fragmentation state: at most one message in flight.
#[derive(Default)]
pub(crate) struct MessageAssembler {
    /// Whole-delivery accumulation buffer.
    buffer: Option<(MessageKind, Vec<u8>)>,
    /// Kind of the partial-delivery message in flight, if any.
    partial: Option<MessageKind>,
}

/// Size caps and delivery modes for one `on_frame` call, read from the
/// session at call time so runtime limit changes take effect.
pub(crate) struct AssemblyLimits {
    pub(crate) text_limit: usize,
    pub(crate) binary_limit: usize,
    pub(crate) text_partial: bool,
    pub(crate) binary_partial: bool,
}

impl MessageAssembler {
    /// Feed one data frame.  Callers must route control frames elsewhere.
    pub(crate) fn on_frame(
        &mut self,
        opcode: OpCode,
        fin: bool,
        payload: Vec<u8>,
        limits: &AssemblyLimits,
    ) -> Result<Assembled, AssemblyError> {
        let kind = match opcode {
            OpCode::Text => {
                if self.buffer.is_some() || self.partial.is_some() {
                    return Err(AssemblyError::Protocol(
                        "data frame while another message is in flight",
                    ));
                }
                MessageKind::Text
            }
            OpCode::Binary => {
                if self.buffer.is_some() || self.partial.is_some() {
                    return Err(AssemblyError::Protocol(
                        "data frame while another message is in flight",
                    ));
                }
                MessageKind::Binary
            }
            OpCode::Continuation => match (&self.buffer, self.partial) {
                (Some((kind, _)), _) => *kind,
                (None, Some(kind)) => kind,
                (None, None) => {
                    return Err(AssemblyError::Protocol(
                        "continuation frame without a message in flight",
                    ));
                }
            },
            _ => {
                return Err(AssemblyError::Protocol("control frame reached the assembler"));
            }
        };

        let limit = match kind {
            MessageKind::Text => limits.text_limit,
            MessageKind::Binary => limits.binary_limit,
        };
        let partial_mode = match kind {
            MessageKind::Text => limits.text_partial,
            MessageKind::Binary => limits.binary_partial,
        };

        if partial_mode {
            return self.fragment(kind, fin, payload, limit);
        }
        self.accumulate(kind, fin, payload, limit)
    }

    /// Whether a message is currently in flight.
    pub(crate) fn in_flight(&self) -> bool {
        self.buffer.is_some() || self.partial.is_some()
    }

    /// Drop any in-flight state; used on fatal protocol errors.
    pub(crate) fn reset(&mut self) {
        self.buffer = None;
        self.partial = None;
    }

    fn fragment(
        &mut self,
        kind: MessageKind,
        fin: bool,
        payload: Vec<u8>,
        limit: usize,
    ) -> Result<Assembled, AssemblyError> {
        if payload.len() > limit {
            self.reset();
            return Err(AssemblyError::Overflow { kind, limit });
        }
        self.partial = if fin { None } else { Some(kind) };
        match kind {
            MessageKind::Text => {
                let data = String::from_utf8(payload).map_err(|_| {
                    self.reset();
                    AssemblyError::InvalidUtf8
                })?;
                Ok(Assembled::TextFragment { data, last: fin })
            }
            MessageKind::Binary => Ok(Assembled::BinaryFragment {
                data: payload,
                last: fin,
            }),
        }
    }

    fn accumulate(
        &mut self,
        kind: MessageKind,
        fin: bool,
        payload: Vec<u8>,
        limit: usize,
    ) -> Result<Assembled, AssemblyError> {
        let mut buffer = match self.buffer.take() {
            Some((_, buffer)) => buffer,
            None => Vec::new(),
        };

        if buffer.len() + payload.len() > limit {
            self.reset();
            return Err(AssemblyError::Overflow { kind, limit });
        }
        buffer.extend_from_slice(&payload);

        if !fin {
            self.buffer = Some((kind, buffer));
            return Ok(Assembled::Pending);
        }

        match kind {
            MessageKind::Text => match String::from_utf8(buffer) {
                Ok(text) => Ok(Assembled::Text(text)),
                Err(_) => Err(AssemblyError::InvalidUtf8),
            },
            MessageKind::Binary => Ok(Assembled::Binary(buffer)),
        }
    }
}
