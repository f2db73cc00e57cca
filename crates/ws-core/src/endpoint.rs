//! Declarative endpoint definitions.
//!
//! An endpoint is a handler plus a URI template.  Handlers declare their
//! callbacks up front: each callback names its formal parameters as a list
//! of [`Param`] binding sources, and receives an [`Args`] buffer filled
//! positionally at dispatch time.  There is no reflection anywhere — the
//! registry validates the declaration once and compiles it into an
//! immutable binding plan, so the per-message hot path is a single pass
//! over precomputed slots.
//!
//! The typed [`EndpointBuilder`] keeps user code free of `dyn Any`: the
//! per-session state type `H` is erased at `build()`, and every callback
//! closure is wrapped so it sees `&mut H` directly.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::Cursor;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use ws_proto::CloseReason;

use crate::codec::{Decoder, Encoder};
use crate::error::{CodecError, DispatchError, HandlerError};
use crate::session::Session;

// ---------------------------------------------------------------------------
// Parameter targets and message shapes
// ---------------------------------------------------------------------------

/// Target type of a path parameter or of a primitive text message.
///
/// Parsed values are delivered boxed; a path parameter whose name has no
/// template variable binds null rather than a zero value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathTarget {
    Str,
    Bool,
    Char,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl PathTarget {
    /// Parse a raw captured segment into the target type.
    pub(crate) fn parse(self, raw: &str) -> Result<Box<dyn Any + Send>, CodecError> {
        fn parse_as<T>(raw: &str) -> Result<Box<dyn Any + Send>, CodecError>
        where
            T: std::str::FromStr + Any + Send,
            T::Err: std::fmt::Display,
        {
            raw.parse::<T>()
                .map(|v| Box::new(v) as Box<dyn Any + Send>)
                .map_err(|e| CodecError::new(format!("cannot parse `{raw}`: {e}")))
        }

        match self {
            PathTarget::Str => Ok(Box::new(raw.to_owned())),
            PathTarget::Bool => parse_as::<bool>(raw),
            PathTarget::Char => parse_as::<char>(raw),
            PathTarget::I8 => parse_as::<i8>(raw),
            PathTarget::I16 => parse_as::<i16>(raw),
            PathTarget::I32 => parse_as::<i32>(raw),
            PathTarget::I64 => parse_as::<i64>(raw),
            PathTarget::U8 => parse_as::<u8>(raw),
            PathTarget::U16 => parse_as::<u16>(raw),
            PathTarget::U32 => parse_as::<u32>(raw),
            PathTarget::U64 => parse_as::<u64>(raw),
            PathTarget::F32 => parse_as::<f32>(raw),
            PathTarget::F64 => parse_as::<f64>(raw),
        }
    }
}

/// Declared shape of a message callback's payload parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageShape {
    /// Whole text message as a string.
    Text,
    /// Whole text message behind a reader over the buffered content.
    Reader,
    /// Whole text message parsed into a primitive target.
    Primitive(PathTarget),
    /// Whole binary message as an owned buffer.
    Binary,
    /// Whole binary message as a byte vector.  Equivalent to `Binary` at
    /// runtime; kept as a distinct declaration for callers that think in
    /// arrays.
    BinaryArray,
    /// Whole binary message behind a reader over the buffered content.
    InputStream,
    /// Pong application data.
    Pong,
    /// A custom type produced by a registered decoder.
    Custom {
        type_id: TypeId,
        type_name: &'static str,
    },
}

impl MessageShape {
    /// Shape for a decoder-produced type `T`.
    pub fn custom<T: Any>() -> Self {
        MessageShape::Custom {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub(crate) fn payload_word(self) -> &'static str {
        match self {
            MessageShape::Text => "text",
            MessageShape::Reader => "reader",
            MessageShape::Primitive(_) => "primitive",
            MessageShape::Binary => "binary",
            MessageShape::BinaryArray => "byte-array",
            MessageShape::InputStream => "input-stream",
            MessageShape::Pong => "pong",
            MessageShape::Custom { .. } => "custom-type",
        }
    }
}

/// One formal parameter of a callback: where its runtime value comes from.
#[derive(Debug, Clone)]
pub enum Param {
    /// The session handle.
    Session,
    /// The endpoint configuration (open callbacks only).
    Config,
    /// The close reason (close callbacks only).
    CloseReason,
    /// The failure being reported (error callbacks only; mandatory there).
    Cause,
    /// A named path parameter parsed into a target type.
    PathParam { name: String, target: PathTarget },
    /// The message payload (message callbacks only; exactly one).
    Message(MessageShape),
    /// Last-fragment indicator for partial delivery; must be the final
    /// parameter of a text or binary message callback.
    LastFlag,
}

impl Param {
    pub fn path_param(name: impl Into<String>, target: PathTarget) -> Self {
        Param::PathParam {
            name: name.into(),
            target,
        }
    }

    pub fn message(shape: MessageShape) -> Self {
        Param::Message(shape)
    }

    pub(crate) fn word(&self) -> &'static str {
        match self {
            Param::Session => "session",
            Param::Config => "config",
            Param::CloseReason => "close-reason",
            Param::Cause => "cause",
            Param::PathParam { .. } => "path-param",
            Param::Message(_) => "message",
            Param::LastFlag => "last-flag",
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime argument buffer
// ---------------------------------------------------------------------------

/// One filled argument slot.
pub enum Arg {
    Session(Arc<Session>),
    Config(Arc<EndpointConfig>),
    CloseReason(CloseReason),
    Cause(Arc<DispatchError>),
    /// `None` value means the declared name has no template variable.
    PathParam {
        name: Arc<str>,
        value: Option<Box<dyn Any + Send>>,
    },
    Text(String),
    Binary(Vec<u8>),
    Pong(Vec<u8>),
    Object(Box<dyn Any + Send>),
    Last(bool),
}

/// Positional argument buffer handed to a callback, filled in one pass from
/// the compiled binding plan.  Positions mirror the declared [`Param`] list;
/// the scanning accessors are conveniences for the common single-occurrence
/// parameters.
pub struct Args(Box<[Arg]>);

impl Args {
    pub(crate) fn new(args: Vec<Arg>) -> Self {
        Args(args.into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.0.get(index)
    }

    /// First session argument, if the callback declared one.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.0.iter().find_map(|arg| match arg {
            Arg::Session(session) => Some(session),
            _ => None,
        })
    }

    pub fn config(&self) -> Option<&Arc<EndpointConfig>> {
        self.0.iter().find_map(|arg| match arg {
            Arg::Config(config) => Some(config),
            _ => None,
        })
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.0.iter().find_map(|arg| match arg {
            Arg::CloseReason(reason) => Some(reason),
            _ => None,
        })
    }

    pub fn cause(&self) -> Option<&Arc<DispatchError>> {
        self.0.iter().find_map(|arg| match arg {
            Arg::Cause(cause) => Some(cause),
            _ => None,
        })
    }

    /// A named path parameter.  Outer `None`: the callback declared no such
    /// parameter.  Inner `None`: the name has no template variable (null).
    pub fn path_param(&self, name: &str) -> Option<Option<&(dyn Any + Send)>> {
        self.0.iter().find_map(|arg| match arg {
            Arg::PathParam { name: n, value } if n.as_ref() == name => {
                Some(value.as_deref())
            }
            _ => None,
        })
    }

    /// A named path parameter downcast to its target type.
    pub fn path_param_as<T: Any>(&self, name: &str) -> Option<&T> {
        self.path_param(name)??.downcast_ref::<T>()
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        match self.0.get(index) {
            Some(Arg::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn binary(&self, index: usize) -> Option<&[u8]> {
        match self.0.get(index) {
            Some(Arg::Binary(data)) => Some(data),
            _ => None,
        }
    }

    /// Reader over a buffered text or binary payload.
    pub fn reader(&self, index: usize) -> Option<Cursor<&[u8]>> {
        match self.0.get(index) {
            Some(Arg::Text(text)) => Some(Cursor::new(text.as_bytes())),
            Some(Arg::Binary(data)) => Some(Cursor::new(data)),
            _ => None,
        }
    }

    pub fn pong(&self, index: usize) -> Option<&[u8]> {
        match self.0.get(index) {
            Some(Arg::Pong(data)) => Some(data),
            _ => None,
        }
    }

    pub fn object(&self, index: usize) -> Option<&(dyn Any + Send)> {
        match self.0.get(index) {
            Some(Arg::Object(value)) => Some(value.as_ref()),
            _ => None,
        }
    }

    /// A decoded object downcast to its concrete type.
    pub fn object_as<T: Any>(&self, index: usize) -> Option<&T> {
        self.object(index)?.downcast_ref::<T>()
    }

    /// The last-fragment flag, if the callback declared one.
    pub fn is_last(&self) -> Option<bool> {
        self.0.iter().find_map(|arg| match arg {
            Arg::Last(last) => Some(*last),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Callback return values
// ---------------------------------------------------------------------------

/// Value returned by a message callback; non-`None` returns are sent back
/// to the peer on the same session (the return-value auto-reply contract).
pub enum Reply {
    None,
    /// Sent as a single text message.
    Text(String),
    /// Sent as a single binary message.
    Binary(Vec<u8>),
    /// Routed through the endpoint's encoders, with the primitive/string
    /// fallback as the final arm.
    Object {
        value: Box<dyn Any + Send>,
        type_name: &'static str,
    },
}

impl Reply {
    /// An object reply; the value is matched against registered encoders by
    /// its concrete type.
    pub fn object<T: Any + Send>(value: T) -> Self {
        Reply::Object {
            value: Box::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }
}

// ---------------------------------------------------------------------------
// Erased callback plumbing
// ---------------------------------------------------------------------------

pub(crate) type HandlerState = Box<dyn Any + Send>;
pub(crate) type CallbackFn =
    Arc<dyn Fn(&mut (dyn Any + Send), &Args) -> Result<Reply, HandlerError> + Send + Sync>;
pub(crate) type StateFactory = Arc<dyn Fn() -> HandlerState + Send + Sync>;

/// Which lifecycle marker a declared callback carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeclaredRole {
    Open,
    Close,
    Error,
    Message,
}

pub(crate) struct DeclaredCallback {
    pub(crate) role: DeclaredRole,
    pub(crate) params: Vec<Param>,
    pub(crate) invoke: CallbackFn,
}

// ---------------------------------------------------------------------------
// Endpoint configuration
// ---------------------------------------------------------------------------

/// Configuration handed to open callbacks and to codec `init`.
pub struct EndpointConfig {
    path: String,
    subprotocols: Vec<String>,
    user_properties: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl EndpointConfig {
    pub(crate) fn new(path: String, subprotocols: Vec<String>) -> Self {
        EndpointConfig {
            path,
            subprotocols,
            user_properties: RwLock::new(HashMap::new()),
        }
    }

    /// The URI template the endpoint was registered under.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Subprotocols the endpoint declares, in declaration order.
    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    pub fn insert_user_property(
        &self,
        key: impl Into<String>,
        value: Arc<dyn Any + Send + Sync>,
    ) {
        if let Ok(mut props) = self.user_properties.write() {
            props.insert(key.into(), value);
        }
    }

    pub fn user_property(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_properties.read().ok()?.get(key).cloned()
    }
}

// ---------------------------------------------------------------------------
// Endpoint definition and builder
// ---------------------------------------------------------------------------

/// A declared (not yet validated) endpoint: handler factory, callbacks,
/// codecs, and URI template.  Produced by [`EndpointBuilder`], consumed by
/// `Server::register`.
pub struct Endpoint {
    pub(crate) path: String,
    pub(crate) subprotocols: Vec<String>,
    pub(crate) factory: StateFactory,
    pub(crate) declared: Vec<DeclaredCallback>,
    pub(crate) decoders: Vec<Decoder>,
    pub(crate) encoders: Vec<Encoder>,
}

impl Endpoint {
    /// Start building an endpoint at `path`.  `factory` produces one fresh
    /// handler state per session.
    pub fn builder<H, F>(path: impl Into<String>, factory: F) -> EndpointBuilder<H>
    where
        H: Send + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        EndpointBuilder {
            path: path.into(),
            subprotocols: Vec::new(),
            factory: Arc::new(move || Box::new(factory()) as HandlerState),
            declared: Vec::new(),
            decoders: Vec::new(),
            encoders: Vec::new(),
            _state: PhantomData,
        }
    }
}

/// Builder for [`Endpoint`], typed over the per-session handler state `H`.
pub struct EndpointBuilder<H> {
    path: String,
    subprotocols: Vec<String>,
    factory: StateFactory,
    declared: Vec<DeclaredCallback>,
    decoders: Vec<Decoder>,
    encoders: Vec<Encoder>,
    _state: PhantomData<fn() -> H>,
}

impl<H: Send + 'static> EndpointBuilder<H> {
    fn erase_lifecycle<F>(callback: F) -> CallbackFn
    where
        F: Fn(&mut H, &Args) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Arc::new(move |state, args| match state.downcast_mut::<H>() {
            Some(handler) => callback(handler, args).map(|()| Reply::None),
            None => Err(HandlerError::fatal("endpoint state type mismatch")),
        })
    }

    fn declare(mut self, role: DeclaredRole, params: Vec<Param>, invoke: CallbackFn) -> Self {
        self.declared.push(DeclaredCallback {
            role,
            params,
            invoke,
        });
        self
    }

    /// Declare the open callback.
    pub fn on_open<F>(self, params: Vec<Param>, callback: F) -> Self
    where
        F: Fn(&mut H, &Args) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let invoke = Self::erase_lifecycle(callback);
        self.declare(DeclaredRole::Open, params, invoke)
    }

    /// Declare the close callback.
    pub fn on_close<F>(self, params: Vec<Param>, callback: F) -> Self
    where
        F: Fn(&mut H, &Args) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let invoke = Self::erase_lifecycle(callback);
        self.declare(DeclaredRole::Close, params, invoke)
    }

    /// Declare the error callback.  Its parameter list must include
    /// [`Param::Cause`].
    pub fn on_error<F>(self, params: Vec<Param>, callback: F) -> Self
    where
        F: Fn(&mut H, &Args) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let invoke = Self::erase_lifecycle(callback);
        self.declare(DeclaredRole::Error, params, invoke)
    }

    /// Declare a message callback.  Whether it receives text, binary, or
    /// pong traffic is derived from its declared message shape at
    /// registration.
    pub fn on_message<F>(self, params: Vec<Param>, callback: F) -> Self
    where
        F: Fn(&mut H, &Args) -> Result<Reply, HandlerError> + Send + Sync + 'static,
    {
        let invoke: CallbackFn =
            Arc::new(move |state, args| match state.downcast_mut::<H>() {
                Some(handler) => callback(handler, args),
                None => Err(HandlerError::fatal("endpoint state type mismatch")),
            });
        self.declare(DeclaredRole::Message, params, invoke)
    }

    /// Register a decoder; declaration order is consultation order.
    pub fn decoder(mut self, decoder: Decoder) -> Self {
        self.decoders.push(decoder);
        self
    }

    /// Register an encoder; declaration order is consultation order.
    pub fn encoder(mut self, encoder: Encoder) -> Self {
        self.encoders.push(encoder);
        self
    }

    /// Declare the subprotocols this endpoint understands.
    pub fn subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    /// Finish the declaration, erasing the state type.
    pub fn build(self) -> Endpoint {
        Endpoint {
            path: self.path,
            subprotocols: self.subprotocols,
            factory: self.factory,
            declared: self.declared,
            decoders: self.decoders,
            encoders: self.encoders,
        }
    }
}
