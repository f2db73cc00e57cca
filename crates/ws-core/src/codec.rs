//! Encoder/decoder pipeline.
//!
//! Endpoints declare codecs as trait objects over a shared [`Codec`]
//! lifecycle: `init` once at endpoint activation, `destroy` at dispose.
//! Inbound selection walks decoders in declaration order, filtered by the
//! decoded target type and gated by `will_decode`; stream decoders carry no
//! predicate and accept whenever the target matches, driven over the
//! buffered whole message.  Outbound selection matches encoders by the
//! concrete type of the value, text side first, then binary, then the
//! string/primitive `to_string` fallback.
//!
//! Codecs are shared across sessions and must be safe to drive concurrently
//! once initialized.

use std::any::{Any, TypeId};
use std::io::{BufRead, Read, Write};
use std::sync::Arc;

use crate::endpoint::EndpointConfig;
use crate::error::{CodecError, DispatchError, SendError};

/// Shared codec lifecycle and target identification.
pub trait Codec: Send + Sync {
    /// Concrete type this codec decodes into or encodes from.
    fn target(&self) -> TypeId;

    /// Invoked once when the owning endpoint is registered.
    fn init(&self, _config: &EndpointConfig) {}

    /// Invoked once when the owning endpoint is disposed.
    fn destroy(&self) {}
}

/// Decodes a whole text message into the target type.
pub trait TextDecoder: Codec {
    /// Whether this decoder wants the raw message; consulted in
    /// declaration order.
    fn will_decode(&self, raw: &str) -> bool;

    fn decode(&self, raw: &str) -> Result<Box<dyn Any + Send>, CodecError>;
}

/// Decodes a whole text message from a reader over the buffered content.
pub trait TextStreamDecoder: Codec {
    fn decode(&self, reader: &mut dyn BufRead) -> Result<Box<dyn Any + Send>, CodecError>;
}

/// Decodes a whole binary message into the target type.
pub trait BinaryDecoder: Codec {
    fn will_decode(&self, raw: &[u8]) -> bool;

    fn decode(&self, raw: &[u8]) -> Result<Box<dyn Any + Send>, CodecError>;
}

/// Decodes a whole binary message from a reader over the buffered content.
pub trait BinaryStreamDecoder: Codec {
    fn decode(&self, reader: &mut dyn Read) -> Result<Box<dyn Any + Send>, CodecError>;
}

/// Encodes a value into a single text message.
pub trait TextEncoder: Codec {
    fn encode(&self, value: &(dyn Any + Send)) -> Result<String, CodecError>;
}

/// Encodes a value by writing UTF-8 text; the buffered output is sent as a
/// single text message.
pub trait TextStreamEncoder: Codec {
    fn encode(&self, value: &(dyn Any + Send), writer: &mut dyn Write) -> Result<(), CodecError>;
}

/// Encodes a value into a single binary message.
pub trait BinaryEncoder: Codec {
    fn encode(&self, value: &(dyn Any + Send)) -> Result<Vec<u8>, CodecError>;
}

/// Encodes a value by writing bytes; the buffered output is sent as a
/// single binary message.
pub trait BinaryStreamEncoder: Codec {
    fn encode(&self, value: &(dyn Any + Send), writer: &mut dyn Write) -> Result<(), CodecError>;
}

// ---------------------------------------------------------------------------
// Declaration-order codec lists
// ---------------------------------------------------------------------------

/// A registered decoder in one of its four flavors.
#[derive(Clone)]
pub enum Decoder {
    Text(Arc<dyn TextDecoder>),
    TextStream(Arc<dyn TextStreamDecoder>),
    Binary(Arc<dyn BinaryDecoder>),
    BinaryStream(Arc<dyn BinaryStreamDecoder>),
}

impl Decoder {
    pub(crate) fn target(&self) -> TypeId {
        match self {
            Decoder::Text(d) => d.target(),
            Decoder::TextStream(d) => d.target(),
            Decoder::Binary(d) => d.target(),
            Decoder::BinaryStream(d) => d.target(),
        }
    }

    pub(crate) fn is_text_side(&self) -> bool {
        matches!(self, Decoder::Text(_) | Decoder::TextStream(_))
    }

    fn init(&self, config: &EndpointConfig) {
        match self {
            Decoder::Text(d) => d.init(config),
            Decoder::TextStream(d) => d.init(config),
            Decoder::Binary(d) => d.init(config),
            Decoder::BinaryStream(d) => d.init(config),
        }
    }

    fn destroy(&self) {
        match self {
            Decoder::Text(d) => d.destroy(),
            Decoder::TextStream(d) => d.destroy(),
            Decoder::Binary(d) => d.destroy(),
            Decoder::BinaryStream(d) => d.destroy(),
        }
    }
}

/// A registered encoder in one of its four flavors.
#[derive(Clone)]
pub enum Encoder {
    Text(Arc<dyn TextEncoder>),
    TextStream(Arc<dyn TextStreamEncoder>),
    Binary(Arc<dyn BinaryEncoder>),
    BinaryStream(Arc<dyn BinaryStreamEncoder>),
}

impl Encoder {
    fn target(&self) -> TypeId {
        match self {
            Encoder::Text(e) => e.target(),
            Encoder::TextStream(e) => e.target(),
            Encoder::Binary(e) => e.target(),
            Encoder::BinaryStream(e) => e.target(),
        }
    }

    fn is_text_side(&self) -> bool {
        matches!(self, Encoder::Text(_) | Encoder::TextStream(_))
    }

    fn init(&self, config: &EndpointConfig) {
        match self {
            Encoder::Text(e) => e.init(config),
            Encoder::TextStream(e) => e.init(config),
            Encoder::Binary(e) => e.init(config),
            Encoder::BinaryStream(e) => e.init(config),
        }
    }

    fn destroy(&self) {
        match self {
            Encoder::Text(e) => e.destroy(),
            Encoder::TextStream(e) => e.destroy(),
            Encoder::Binary(e) => e.destroy(),
            Encoder::BinaryStream(e) => e.destroy(),
        }
    }
}

/// An encoded outbound message ready for framing.
pub(crate) enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Suite
// ---------------------------------------------------------------------------

/// The codec set of one endpoint, in declaration order.
pub(crate) struct CodecSuite {
    decoders: Vec<Decoder>,
    encoders: Vec<Encoder>,
}

impl CodecSuite {
    pub(crate) fn new(decoders: Vec<Decoder>, encoders: Vec<Encoder>) -> Self {
        CodecSuite { decoders, encoders }
    }

    pub(crate) fn init(&self, config: &EndpointConfig) {
        for decoder in &self.decoders {
            decoder.init(config);
        }
        for encoder in &self.encoders {
            encoder.init(config);
        }
    }

    pub(crate) fn destroy(&self) {
        for decoder in &self.decoders {
            decoder.destroy();
        }
        for encoder in &self.encoders {
            encoder.destroy();
        }
    }

    pub(crate) fn has_text_decoder_for(&self, target: TypeId) -> bool {
        self.decoders
            .iter()
            .any(|d| d.is_text_side() && d.target() == target)
    }

    pub(crate) fn has_binary_decoder_for(&self, target: TypeId) -> bool {
        self.decoders
            .iter()
            .any(|d| !d.is_text_side() && d.target() == target)
    }

    /// Decode a whole text message into a custom target type.
    pub(crate) fn decode_text(
        &self,
        target: TypeId,
        type_name: &'static str,
        raw: &str,
    ) -> Result<Box<dyn Any + Send>, DispatchError> {
        for decoder in &self.decoders {
            match decoder {
                Decoder::Text(d) if d.target() == target => {
                    if d.will_decode(raw) {
                        return d.decode(raw).map_err(DispatchError::Decode);
                    }
                }
                Decoder::TextStream(d) if d.target() == target => {
                    let mut reader = std::io::Cursor::new(raw.as_bytes());
                    return d.decode(&mut reader).map_err(DispatchError::Decode);
                }
                _ => {}
            }
        }
        Err(DispatchError::Decode(CodecError::new(format!(
            "no text decoder accepted a message for `{type_name}`"
        ))))
    }

    /// Decode a whole binary message into a custom target type.
    pub(crate) fn decode_binary(
        &self,
        target: TypeId,
        type_name: &'static str,
        raw: &[u8],
    ) -> Result<Box<dyn Any + Send>, DispatchError> {
        for decoder in &self.decoders {
            match decoder {
                Decoder::Binary(d) if d.target() == target => {
                    if d.will_decode(raw) {
                        return d.decode(raw).map_err(DispatchError::Decode);
                    }
                }
                Decoder::BinaryStream(d) if d.target() == target => {
                    let mut reader = std::io::Cursor::new(raw);
                    return d.decode(&mut reader).map_err(DispatchError::Decode);
                }
                _ => {}
            }
        }
        Err(DispatchError::Decode(CodecError::new(format!(
            "no binary decoder accepted a message for `{type_name}`"
        ))))
    }

    /// Encode an outbound object: text encoders first, then binary, then
    /// the string/primitive fallback arm.
    pub(crate) fn encode(
        &self,
        value: &(dyn Any + Send),
        type_name: &'static str,
    ) -> Result<Outgoing, SendError> {
        let target = value.type_id();

        for encoder in self.encoders.iter().filter(|e| e.is_text_side()) {
            if encoder.target() != target {
                continue;
            }
            return match encoder {
                Encoder::Text(e) => e
                    .encode(value)
                    .map(Outgoing::Text)
                    .map_err(|e| SendError::Encoder(e.to_string())),
                Encoder::TextStream(e) => {
                    let mut buffer = Vec::new();
                    e.encode(value, &mut buffer)
                        .map_err(|e| SendError::Encoder(e.to_string()))?;
                    String::from_utf8(buffer)
                        .map(Outgoing::Text)
                        .map_err(|_| {
                            SendError::Encoder(format!(
                                "text stream encoder for `{type_name}` wrote invalid UTF-8"
                            ))
                        })
                }
                _ => unreachable!("filtered to text side"),
            };
        }

        for encoder in self.encoders.iter().filter(|e| !e.is_text_side()) {
            if encoder.target() != target {
                continue;
            }
            return match encoder {
                Encoder::Binary(e) => e
                    .encode(value)
                    .map(Outgoing::Binary)
                    .map_err(|e| SendError::Encoder(e.to_string())),
                Encoder::BinaryStream(e) => {
                    let mut buffer = Vec::new();
                    e.encode(value, &mut buffer)
                        .map_err(|e| SendError::Encoder(e.to_string()))?;
                    Ok(Outgoing::Binary(buffer))
                }
                _ => unreachable!("filtered to binary side"),
            };
        }

        match fallback_text(value) {
            Some(text) => Ok(Outgoing::Text(text)),
            None => Err(SendError::NoEncoder(type_name)),
        }
    }
}

/// Final arm of encoder selection: strings and primitives send as text.
fn fallback_text(value: &(dyn Any + Send)) -> Option<String> {
    macro_rules! try_display {
        ($($ty:ty),* $(,)?) => {
            $(
                if let Some(v) = value.downcast_ref::<$ty>() {
                    return Some(v.to_string());
                }
            )*
        };
    }
    try_display!(
        String,
        &'static str,
        bool,
        char,
        i8,
        i16,
        i32,
        i64,
        i128,
        isize,
        u8,
        u16,
        u32,
        u64,
        u128,
        usize,
        f32,
        f64,
    );
    None
}
