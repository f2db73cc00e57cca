// ws-core: WebSocket endpoint dispatch engine.
//
// Sits between an RFC 6455 framing layer and user-supplied endpoint
// handlers: URI-template routing, declarative callback validation, message
// reassembly, the codec pipeline, session state, open-session tracking, and
// per-connection dispatch.  The wire codec, the HTTP upgrade handshake,
// TLS, and the listener are external collaborators speaking the `transport`
// seam.
//
// Lifecycle of a connection:
//   on_upgrade -> endpoint match -> session + dispatcher task -> open
//   callback -> frames in arrival order through assembler/codecs/callbacks
//   -> close sequencing -> tracker removal.

mod assembler;
mod codec;
mod config;
mod descriptor;
mod dispatcher;
mod endpoint;
mod error;
mod registry;
mod session;
mod tracker;
mod transport;
mod uri_template;
mod validator;

pub use codec::{
    BinaryDecoder, BinaryEncoder, BinaryStreamDecoder, BinaryStreamEncoder, Codec, Decoder,
    Encoder, TextDecoder, TextEncoder, TextStreamDecoder, TextStreamEncoder,
};
pub use config::{DEFAULT_DISPOSE_GRACE_MS, DEFAULT_MESSAGE_BUFFER_SIZE, ServerConfig};
pub use endpoint::{
    Arg, Args, Endpoint, EndpointBuilder, EndpointConfig, MessageShape, Param, PathTarget,
    Reply,
};
pub use error::{
    CodecError, ConfigError, DispatchError, HandlerError, MAX_CALLBACK_PARAMS, SendError,
    UpgradeError,
};
pub use registry::{EndpointHandle, Server};
pub use session::{
    AsyncRemote, BasicRemote, MessageHandler, SendFuture, SendResult, Session, SessionState,
};
pub use transport::{
    ConnectionId, TransportCommand, TransportHandle, UpgradeAccept, UpgradeRequest, WriteAck,
};
pub use uri_template::{PathParams, UriTemplate};
pub use validator::CallbackKind;
