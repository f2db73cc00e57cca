//! Per-connection session state and remote endpoints.
//!
//! A [`Session`] is created when the handshake binds a connection to an
//! endpoint and lives until the close callback has completed and the
//! transport reference is gone.  Callbacks run on the connection's
//! dispatcher task and are synchronous; everything callbacks may touch here
//! (properties, limits, snapshots, close) is therefore lock-cheap and
//! non-async.  Sends go through the remotes: [`BasicRemote`] resolves when
//! the transport acknowledges the write, [`AsyncRemote`] hands back a
//! [`SendFuture`] immediately.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use ws_proto::{CloseReason, Frame, OpCode, MAX_CONTROL_PAYLOAD};

use crate::codec::Outgoing;
use crate::descriptor::EndpointDescriptor;
use crate::dispatcher::ConnEvent;
use crate::endpoint::EndpointConfig;
use crate::error::SendError;
use crate::transport::TransportHandle;
use crate::uri_template::PathParams;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Open => 0,
            SessionState::Closing => 1,
            SessionState::Closed => 2,
        }
    }
}

/// Opaque handler registration surface.
///
/// In the declarative model dispatch is driven entirely by the compiled
/// endpoint plan; handlers stored here are kept, counted, and enumerated
/// but never invoked by the engine.
pub trait MessageHandler: Send + Sync {}

/// Which kind of partial outbound message is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartialOut {
    Text,
    Binary,
}

/// Runtime state of one accepted connection against one endpoint.
pub struct Session {
    id: String,
    request_uri: String,
    query_string: Option<String>,
    parameter_map: HashMap<String, Vec<String>>,
    path_params: PathParams,
    secure: bool,
    subprotocol: Option<String>,
    principal: Option<String>,
    config: Arc<EndpointConfig>,
    descriptor: Arc<EndpointDescriptor>,
    tracker: Weak<crate::tracker::SessionTracker>,
    transport: TransportHandle,
    events: mpsc::UnboundedSender<ConnEvent>,

    state: AtomicU8,
    close_requested: AtomicBool,
    max_idle_timeout_ms: AtomicU64,
    max_text_message_buffer_size: AtomicUsize,
    max_binary_message_buffer_size: AtomicUsize,

    user_properties: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    message_handlers: Mutex<Vec<Arc<dyn MessageHandler>>>,
    partial_out: Mutex<Option<PartialOut>>,
}

pub(crate) struct SessionContext {
    pub(crate) request_uri: String,
    pub(crate) path_params: PathParams,
    pub(crate) secure: bool,
    pub(crate) subprotocol: Option<String>,
    pub(crate) principal: Option<String>,
    pub(crate) config: Arc<EndpointConfig>,
    pub(crate) descriptor: Arc<EndpointDescriptor>,
    pub(crate) tracker: Weak<crate::tracker::SessionTracker>,
    pub(crate) transport: TransportHandle,
    pub(crate) events: mpsc::UnboundedSender<ConnEvent>,
    pub(crate) max_idle_timeout_ms: u64,
    pub(crate) max_text_message_buffer_size: usize,
    pub(crate) max_binary_message_buffer_size: usize,
}

impl Session {
    pub(crate) fn new(ctx: SessionContext) -> Arc<Self> {
        let (query_string, parameter_map) = split_query(&ctx.request_uri);
        Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            request_uri: ctx.request_uri,
            query_string,
            parameter_map,
            path_params: ctx.path_params,
            secure: ctx.secure,
            subprotocol: ctx.subprotocol,
            principal: ctx.principal,
            config: ctx.config,
            descriptor: ctx.descriptor,
            tracker: ctx.tracker,
            transport: ctx.transport,
            events: ctx.events,
            state: AtomicU8::new(SessionState::Open.as_u8()),
            close_requested: AtomicBool::new(false),
            max_idle_timeout_ms: AtomicU64::new(ctx.max_idle_timeout_ms),
            max_text_message_buffer_size: AtomicUsize::new(ctx.max_text_message_buffer_size),
            max_binary_message_buffer_size: AtomicUsize::new(
                ctx.max_binary_message_buffer_size,
            ),
            user_properties: RwLock::new(HashMap::new()),
            message_handlers: Mutex::new(Vec::new()),
            partial_out: Mutex::new(None),
        })
    }

    // -- identity and handshake context --

    /// Unique id of this session, fresh per connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full request URI including any query component.
    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    /// Query component of the request URI, if present.
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Parsed query parameters; multi-valued keys keep their order.
    pub fn request_parameter_map(&self) -> &HashMap<String, Vec<String>> {
        &self.parameter_map
    }

    /// Path parameters captured by the endpoint's URI template.
    pub fn path_params(&self) -> &PathParams {
        &self.path_params
    }

    /// WebSocket protocol version; always "13" for RFC 6455.
    pub fn protocol_version(&self) -> &'static str {
        "13"
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Subprotocol agreed during the handshake, if any.
    pub fn negotiated_subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Authenticated principal from the handshake, if any.
    pub fn user_principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Configuration of the endpoint this session is attached to.
    pub fn endpoint_config(&self) -> &Arc<EndpointConfig> {
        &self.config
    }

    // -- limits --

    /// Idle timeout in milliseconds; 0 means idle closing is disabled.
    pub fn max_idle_timeout_ms(&self) -> u64 {
        self.max_idle_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_max_idle_timeout_ms(&self, timeout: u64) {
        self.max_idle_timeout_ms.store(timeout, Ordering::Relaxed);
    }

    pub fn max_text_message_buffer_size(&self) -> usize {
        self.max_text_message_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_max_text_message_buffer_size(&self, size: usize) {
        self.max_text_message_buffer_size
            .store(size, Ordering::Relaxed);
    }

    pub fn max_binary_message_buffer_size(&self) -> usize {
        self.max_binary_message_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_max_binary_message_buffer_size(&self, size: usize) {
        self.max_binary_message_buffer_size
            .store(size, Ordering::Relaxed);
    }

    // -- state --

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    // -- user properties --

    /// Store a session-scoped property.  Thread-safe for concurrent
    /// put/get; lifetime equals the session's.
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

    pub fn remove_user_property(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_properties.write().ok()?.remove(key)
    }

    // -- open-session snapshot --

    /// Point-in-time snapshot of the OPEN sessions registered with the same
    /// endpoint as this one.  The snapshot may include this session.
    pub fn open_sessions(&self) -> Vec<Arc<Session>> {
        match self.tracker.upgrade() {
            Some(tracker) => tracker
                .snapshot()
                .into_iter()
                .filter(|s| s.is_open())
                .collect(),
            None => Vec::new(),
        }
    }

    // -- opaque message handler surface --

    pub fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        if let Ok(mut handlers) = self.message_handlers.lock() {
            handlers.push(handler);
        }
    }

    pub fn message_handlers(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.message_handlers
            .lock()
            .map(|handlers| handlers.clone())
            .unwrap_or_default()
    }

    pub fn remove_message_handler(&self, handler: &Arc<dyn MessageHandler>) {
        if let Ok(mut handlers) = self.message_handlers.lock() {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    // -- close --

    /// Initiate an orderly close with code 1000.
    pub fn close(&self) {
        self.close_with_reason(CloseReason::normal());
    }

    /// Initiate an orderly close.  Idempotent: after the first call (or a
    /// transport-initiated close) further calls are success no-ops.
    pub fn close_with_reason(&self, reason: CloseReason) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.state() != SessionState::Open {
            return;
        }
        debug!(session_id = %self.id, code = u16::from(reason.code), "session close requested");
        let _ = self.events.send(ConnEvent::UserClose(reason));
    }

    // -- remotes --

    pub fn basic_remote(self: &Arc<Self>) -> BasicRemote {
        BasicRemote {
            session: Arc::clone(self),
        }
    }

    pub fn async_remote(self: &Arc<Self>) -> AsyncRemote {
        AsyncRemote {
            session: Arc::clone(self),
        }
    }

    // -- send plumbing (shared by both remotes and the dispatcher) --

    fn submit(&self, frame: Frame) -> Result<oneshot::Receiver<std::io::Result<()>>, SendError> {
        if self.state() != SessionState::Open {
            return Err(SendError::NotOpen);
        }
        let (tx, rx) = oneshot::channel();
        self.transport
            .send_frame(frame, Some(tx))
            .map_err(|()| SendError::TransportClosed)?;
        Ok(rx)
    }

    fn submit_future(&self, frame: Frame) -> SendFuture {
        match self.submit(frame) {
            Ok(rx) => SendFuture::waiting(rx),
            Err(e) => SendFuture::ready(Err(e)),
        }
    }

    /// Reject whole-message sends while a partial message is in flight.
    fn check_no_partial(&self) -> Result<(), SendError> {
        match self.partial_out.lock() {
            Ok(partial) if partial.is_some() => Err(SendError::PartialInProgress),
            _ => Ok(()),
        }
    }

    pub(crate) fn start_text(&self, text: &str) -> SendFuture {
        if let Err(e) = self.check_no_partial() {
            return SendFuture::ready(Err(e));
        }
        self.submit_future(Frame::text(text))
    }

    pub(crate) fn start_binary(&self, data: &[u8]) -> SendFuture {
        if let Err(e) = self.check_no_partial() {
            return SendFuture::ready(Err(e));
        }
        self.submit_future(Frame::binary(data.to_vec()))
    }

    pub(crate) fn start_ping(&self, payload: &[u8]) -> SendFuture {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return SendFuture::ready(Err(SendError::ControlPayloadTooLarge(
                MAX_CONTROL_PAYLOAD,
            )));
        }
        self.submit_future(Frame::ping(payload.to_vec()))
    }

    pub(crate) fn start_pong(&self, payload: &[u8]) -> SendFuture {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return SendFuture::ready(Err(SendError::ControlPayloadTooLarge(
                MAX_CONTROL_PAYLOAD,
            )));
        }
        self.submit_future(Frame::pong(payload.to_vec()))
    }

    pub(crate) fn start_partial(
        &self,
        kind_is_text: bool,
        payload: Vec<u8>,
        last: bool,
    ) -> SendFuture {
        let wanted = if kind_is_text {
            PartialOut::Text
        } else {
            PartialOut::Binary
        };
        let opcode = match self.partial_out.lock() {
            Ok(mut partial) => match *partial {
                Some(open) if open != wanted => {
                    return SendFuture::ready(Err(SendError::PartialInProgress));
                }
                Some(_) => {
                    *partial = if last { None } else { Some(wanted) };
                    OpCode::Continuation
                }
                None => {
                    *partial = if last { None } else { Some(wanted) };
                    if kind_is_text {
                        OpCode::Text
                    } else {
                        OpCode::Binary
                    }
                }
            },
            Err(_) => return SendFuture::ready(Err(SendError::TransportClosed)),
        };
        self.submit_future(Frame {
            opcode,
            fin: last,
            payload,
        })
    }

    /// Route an object through the endpoint's encoders and send the result.
    pub(crate) fn start_object_boxed(
        &self,
        value: Box<dyn Any + Send>,
        type_name: &'static str,
    ) -> SendFuture {
        if let Err(e) = self.check_no_partial() {
            return SendFuture::ready(Err(e));
        }
        match self.descriptor.codecs.encode(value.as_ref(), type_name) {
            Ok(Outgoing::Text(text)) => self.submit_future(Frame::text(text)),
            Ok(Outgoing::Binary(data)) => self.submit_future(Frame::binary(data)),
            Err(e) => SendFuture::ready(Err(e)),
        }
    }
}

fn split_query(uri: &str) -> (Option<String>, HashMap<String, Vec<String>>) {
    let Some((_, query)) = uri.split_once('?') else {
        return (None, HashMap::new());
    };
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.entry(key.to_owned()).or_default().push(value.to_owned());
    }
    (Some(query.to_owned()), map)
}

// ---------------------------------------------------------------------------
// Send futures and results
// ---------------------------------------------------------------------------

enum SendFutureInner {
    Ready(Option<Result<(), SendError>>),
    Waiting(oneshot::Receiver<std::io::Result<()>>),
}

/// Completion of one send operation; resolves on the transport's write
/// acknowledgement.  Dropping the future does not cancel the write.
pub struct SendFuture {
    inner: SendFutureInner,
}

impl SendFuture {
    fn ready(result: Result<(), SendError>) -> Self {
        SendFuture {
            inner: SendFutureInner::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<std::io::Result<()>>) -> Self {
        SendFuture {
            inner: SendFutureInner::Waiting(rx),
        }
    }
}

impl Future for SendFuture {
    type Output = Result<(), SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            SendFutureInner::Ready(slot) => {
                Poll::Ready(slot.take().unwrap_or(Err(SendError::TransportClosed)))
            }
            SendFutureInner::Waiting(rx) => Pin::new(rx).poll(cx).map(|ack| match ack {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SendError::Io(e.to_string())),
                Err(_) => Err(SendError::TransportClosed),
            }),
        }
    }
}

/// Outcome record delivered to send-handler callbacks.
#[derive(Debug, Clone)]
pub struct SendResult {
    exception: Option<SendError>,
}

impl SendResult {
    fn from_outcome(outcome: Result<(), SendError>) -> Self {
        SendResult {
            exception: outcome.err(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.exception.is_none()
    }

    pub fn exception(&self) -> Option<&SendError> {
        self.exception.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Remotes
// ---------------------------------------------------------------------------

/// Send surface whose operations resolve once the transport acknowledges
/// the write.
pub struct BasicRemote {
    session: Arc<Session>,
}

impl BasicRemote {
    pub async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.session.start_text(text).await
    }

    pub async fn send_binary(&self, data: &[u8]) -> Result<(), SendError> {
        self.session.start_binary(data).await
    }

    /// Send an object through the endpoint's encoders; strings and
    /// primitives fall back to a text send of their display form.
    pub async fn send_object<T: Any + Send>(&self, value: T) -> Result<(), SendError> {
        self.session
            .start_object_boxed(Box::new(value), std::any::type_name::<T>())
            .await
    }

    pub async fn send_ping(&self, payload: &[u8]) -> Result<(), SendError> {
        self.session.start_ping(payload).await
    }

    pub async fn send_pong(&self, payload: &[u8]) -> Result<(), SendError> {
        self.session.start_pong(payload).await
    }

    /// Send one fragment of a text message; `last` closes the message.
    pub async fn send_partial_text(&self, text: &str, last: bool) -> Result<(), SendError> {
        self.session
            .start_partial(true, text.as_bytes().to_vec(), last)
            .await
    }

    /// Send one fragment of a binary message; `last` closes the message.
    pub async fn send_partial_binary(&self, data: &[u8], last: bool) -> Result<(), SendError> {
        self.session.start_partial(false, data.to_vec(), last).await
    }
}

/// Send surface whose operations return immediately with a [`SendFuture`].
pub struct AsyncRemote {
    session: Arc<Session>,
}

impl AsyncRemote {
    pub fn send_text(&self, text: &str) -> SendFuture {
        self.session.start_text(text)
    }

    pub fn send_binary(&self, data: &[u8]) -> SendFuture {
        self.session.start_binary(data)
    }

    pub fn send_object<T: Any + Send>(&self, value: T) -> SendFuture {
        self.session
            .start_object_boxed(Box::new(value), std::any::type_name::<T>())
    }

    pub fn send_ping(&self, payload: &[u8]) -> SendFuture {
        self.session.start_ping(payload)
    }

    pub fn send_pong(&self, payload: &[u8]) -> SendFuture {
        self.session.start_pong(payload)
    }

    pub fn send_partial_text(&self, text: &str, last: bool) -> SendFuture {
        self.session.start_partial(true, text.as_bytes().to_vec(), last)
    }

    pub fn send_partial_binary(&self, data: &[u8], last: bool) -> SendFuture {
        self.session.start_partial(false, data.to_vec(), last)
    }

    /// Text send delivering its outcome to `handler` instead of a future.
    pub fn send_text_with_handler<F>(&self, text: &str, handler: F)
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        Self::deliver(self.session.start_text(text), handler);
    }

    pub fn send_binary_with_handler<F>(&self, data: &[u8], handler: F)
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        Self::deliver(self.session.start_binary(data), handler);
    }

    pub fn send_object_with_handler<T, F>(&self, value: T, handler: F)
    where
        T: Any + Send,
        F: FnOnce(SendResult) + Send + 'static,
    {
        Self::deliver(
            self.session
                .start_object_boxed(Box::new(value), std::any::type_name::<T>()),
            handler,
        );
    }

    fn deliver<F>(future: SendFuture, handler: F)
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = future.await;
            handler(SendResult::from_outcome(outcome));
        });
    }
}
