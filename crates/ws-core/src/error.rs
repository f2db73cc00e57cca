//! Error types for the dispatch engine.
//!
//! Four separate surfaces, matching who sees the failure:
//! - [`ConfigError`] — synchronous rejection at registration time; no live
//!   state is created.
//! - [`DispatchError`] — the runtime failure taxonomy routed to an
//!   endpoint's error callback.
//! - [`SendError`] — failures of remote send operations, surfaced to
//!   whichever call initiated the send.
//! - [`UpgradeError`] — handshake-time rejection reported back to the
//!   transport collaborator.

use thiserror::Error;

use crate::validator::CallbackKind;

/// Ceiling on formal parameters per callback.
pub const MAX_CALLBACK_PARAMS: usize = 12;

/// Registration-time rejection.  The registry is never mutated when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate {0} callback")]
    DuplicateCallback(CallbackKind),
    #[error("duplicate path template `{0}`")]
    DuplicateTemplate(String),
    #[error("duplicate path variable `{{{0}}}`")]
    DuplicatePathVariable(String),
    #[error("message callback declares no message parameter")]
    MissingMessageParameter,
    #[error("message callback declares more than one message parameter")]
    ExtraMessageParameter,
    #[error("last-fragment flag must be the final parameter of the callback")]
    MisplacedLastFlag,
    #[error("last-fragment flag cannot accompany a {0} payload")]
    LastFlagUnsupported(&'static str),
    #[error("{param} parameter is not allowed on a {kind} callback")]
    ParameterNotAllowed {
        kind: CallbackKind,
        param: &'static str,
    },
    #[error("error callback must declare a cause parameter")]
    MissingCause,
    #[error("callback declares {0} parameters, limit is {MAX_CALLBACK_PARAMS}")]
    TooManyParameters(usize),
    #[error("no decoder registered for message type `{0}`")]
    UndecodableMessageType(&'static str),
    #[error("message type `{0}` has both text and binary decoders registered")]
    AmbiguousMessageType(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A failure the user's decoder or encoder reports.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CodecError {
    message: String,
}

impl CodecError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        CodecError {
            message: message.to_string(),
        }
    }
}

/// A failure a user callback reports.
///
/// Fatal failures close the connection with 1011 after the error callback
/// has run; non-fatal ones leave the connection open.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    fatal: bool,
}

impl HandlerError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        HandlerError {
            message: message.to_string(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl std::fmt::Display) -> Self {
        HandlerError {
            message: message.to_string(),
            fatal: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

/// The runtime failure taxonomy.  Every variant that reaches a connection is
/// offered to the endpoint's error callback as the cause argument.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A decoder threw, no decoder accepted a custom-typed message, or a
    /// declared primitive/path-parameter target failed to parse.
    #[error("decode failure: {0}")]
    Decode(#[source] CodecError),
    /// No encoder matched an outbound object, or the chosen encoder threw.
    #[error("encode failure: {0}")]
    Encode(#[source] CodecError),
    /// A user callback failed.
    #[error("handler failure: {0}")]
    Handler(#[source] HandlerError),
    /// RFC 6455 violation; closes the connection with 1002 or 1007.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A message outgrew the session's buffer limit; closes with 1009.
    #[error("{kind} message exceeds the {limit}-byte buffer limit")]
    Overflow { kind: &'static str, limit: usize },
    /// The underlying connection died.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Failure of a remote send operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("session is not open")]
    NotOpen,
    #[error("no encoder matches type `{0}`")]
    NoEncoder(&'static str),
    #[error("encoder failure: {0}")]
    Encoder(String),
    #[error("control frame payload exceeds {0} bytes")]
    ControlPayloadTooLarge(usize),
    #[error("a partial message is already in progress")]
    PartialInProgress,
    #[error("transport dropped the connection")]
    TransportClosed,
    #[error("transport write failed: {0}")]
    Io(String),
}

/// Handshake-time rejection, reported to the transport collaborator as the
/// HTTP 404 equivalent.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("no endpoint matches request path `{0}`")]
    NoEndpointMatch(String),
}
