//! Server instance: endpoint registry, live connections, and the inbound
//! transport seam.
//!
//! The registry is read-mostly: handshakes take the read lock, register and
//! dispose serialize on the write lock.  Lookup iterates templates in
//! registration order and the first match wins; equal-specificity ties are
//! therefore broken by registration order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ws_proto::{CloseCode, CloseReason, Frame};

use crate::assembler::MessageAssembler;
use crate::config::ServerConfig;
use crate::descriptor::{self, EndpointDescriptor};
use crate::dispatcher::{ConnEvent, Connection};
use crate::endpoint::Endpoint;
use crate::error::{ConfigError, UpgradeError};
use crate::session::{Session, SessionContext};
use crate::tracker::SessionTracker;
use crate::transport::{ConnectionId, TransportHandle, UpgradeAccept, UpgradeRequest};
use crate::uri_template::UriTemplate;

/// One registered endpoint with its open-session tracker.
pub(crate) struct RegisteredEndpoint {
    pub(crate) descriptor: Arc<EndpointDescriptor>,
    pub(crate) tracker: Arc<SessionTracker>,
    disposed: AtomicBool,
}

pub(crate) struct ServerInner {
    config: ServerConfig,
    endpoints: RwLock<Vec<Arc<RegisteredEndpoint>>>,
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ConnEvent>>>,
}

impl ServerInner {
    pub(crate) fn forget_connection(&self, conn_id: &ConnectionId) {
        if let Ok(mut connections) = self.connections.write() {
            connections.remove(conn_id);
        }
    }
}

/// A WebSocket server instance: owns the endpoint registry and every live
/// connection's dispatch task.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new(ServerConfig::default())
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                config,
                endpoints: RwLock::new(Vec::new()),
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register an endpoint.  Fails with a [`ConfigError`] — leaving the
    /// registry untouched — when the declaration is malformed or the
    /// template is already taken.
    pub fn register(&self, endpoint: Endpoint) -> Result<EndpointHandle, ConfigError> {
        let template = UriTemplate::parse(&endpoint.path)?;
        let descriptor = Arc::new(descriptor::compile(endpoint, template)?);

        let registered = {
            let mut endpoints = self
                .inner
                .endpoints
                .write()
                .map_err(|_| ConfigError::Invalid("registry lock poisoned".to_owned()))?;
            let key = descriptor.template.normalized_key();
            if endpoints
                .iter()
                .any(|e| e.descriptor.template.normalized_key() == key)
            {
                return Err(ConfigError::DuplicateTemplate(
                    descriptor.template.path().to_owned(),
                ));
            }
            let registered = Arc::new(RegisteredEndpoint {
                descriptor: Arc::clone(&descriptor),
                tracker: Arc::new(SessionTracker::new()),
                disposed: AtomicBool::new(false),
            });
            endpoints.push(Arc::clone(&registered));
            registered
        };

        descriptor.codecs.init(&descriptor.config);
        info!(path = descriptor.template.path(), "endpoint registered");

        Ok(EndpointHandle {
            inner: Arc::clone(&self.inner),
            endpoint: registered,
        })
    }

    /// Route an upgrade request to a registered endpoint, spawning the
    /// connection's dispatch task on success.
    pub fn on_upgrade(
        &self,
        request: UpgradeRequest,
        transport: TransportHandle,
    ) -> Result<UpgradeAccept, UpgradeError> {
        let path = request
            .uri
            .split_once('?')
            .map_or(request.uri.as_str(), |(path, _)| path);

        let matched = {
            let endpoints = self
                .inner
                .endpoints
                .read()
                .map_err(|_| UpgradeError::NoEndpointMatch(path.to_owned()))?;
            endpoints
                .iter()
                .filter(|e| !e.disposed.load(Ordering::SeqCst))
                .find_map(|e| {
                    e.descriptor
                        .template
                        .matches(path)
                        .map(|params| (Arc::clone(e), params))
                })
        };
        let Some((endpoint, path_params)) = matched else {
            debug!(path, "upgrade rejected: no endpoint match");
            return Err(UpgradeError::NoEndpointMatch(path.to_owned()));
        };

        let descriptor = Arc::clone(&endpoint.descriptor);
        let subprotocol = if descriptor.config.subprotocols().is_empty() {
            None
        } else {
            request.offered_subprotocols.first().cloned()
        };

        let conn_id = ConnectionId::fresh();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Session::new(SessionContext {
            request_uri: request.uri,
            path_params,
            secure: request.secure,
            subprotocol: subprotocol.clone(),
            principal: request.principal,
            config: Arc::clone(&descriptor.config),
            descriptor: Arc::clone(&descriptor),
            tracker: Arc::downgrade(&endpoint.tracker),
            transport: transport.clone(),
            events: events_tx.clone(),
            max_idle_timeout_ms: self.inner.config.max_idle_timeout_ms,
            max_text_message_buffer_size: self.inner.config.max_text_message_buffer_size,
            max_binary_message_buffer_size: self.inner.config.max_binary_message_buffer_size,
        });

        if let Ok(mut connections) = self.inner.connections.write() {
            connections.insert(conn_id.clone(), events_tx);
        }

        info!(
            connection_id = %conn_id,
            session_id = %session.id(),
            path = descriptor.template.path(),
            "connection upgraded"
        );

        let connection = Connection {
            conn_id: conn_id.clone(),
            server: Arc::clone(&self.inner),
            endpoint,
            state: (descriptor.factory)(),
            descriptor,
            session,
            assembler: MessageAssembler::default(),
            events: events_rx,
            transport,
        };
        tokio::spawn(connection.run());

        Ok(UpgradeAccept {
            connection_id: conn_id,
            subprotocol,
        })
    }

    /// Feed one inbound frame.  Unknown connection ids are ignored.
    pub fn on_frame(&self, conn_id: &ConnectionId, frame: Frame) {
        let Ok(connections) = self.inner.connections.read() else {
            return;
        };
        match connections.get(conn_id) {
            Some(events) => {
                let _ = events.send(ConnEvent::Frame(frame));
            }
            None => debug!(connection_id = %conn_id, "frame for unknown connection"),
        }
    }

    /// Signal that the transport lost the connection.
    pub fn on_transport_closed(&self, conn_id: &ConnectionId, cause: Option<String>) {
        let Ok(connections) = self.inner.connections.read() else {
            return;
        };
        if let Some(events) = connections.get(conn_id) {
            let _ = events.send(ConnEvent::TransportClosed(cause));
        }
    }

    /// Dispose every registered endpoint.
    pub async fn shutdown(&self) {
        let endpoints: Vec<Arc<RegisteredEndpoint>> = self
            .inner
            .endpoints
            .read()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default();
        for endpoint in endpoints {
            dispose_endpoint(&self.inner, &endpoint).await;
        }
    }
}

/// Disposable handle for one registered endpoint.
pub struct EndpointHandle {
    inner: Arc<ServerInner>,
    endpoint: Arc<RegisteredEndpoint>,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("path", &self.endpoint.descriptor.template.path())
            .finish()
    }
}

impl EndpointHandle {
    /// The template the endpoint was registered under.
    pub fn path(&self) -> &str {
        self.endpoint.descriptor.template.path()
    }

    /// Number of sessions currently tracked as open.
    pub fn open_session_count(&self) -> usize {
        self.endpoint.tracker.len()
    }

    /// Remove the endpoint, close its live sessions with 1001, wait out the
    /// grace period, then release its codecs.  Idempotent.
    pub async fn dispose(&self) {
        dispose_endpoint(&self.inner, &self.endpoint).await;
    }
}

async fn dispose_endpoint(inner: &Arc<ServerInner>, endpoint: &Arc<RegisteredEndpoint>) {
    if endpoint.disposed.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(mut endpoints) = inner.endpoints.write() {
        endpoints.retain(|e| !Arc::ptr_eq(e, endpoint));
    }
    info!(path = endpoint.descriptor.template.path(), "endpoint disposed");

    for session in endpoint.tracker.snapshot() {
        session.close_with_reason(CloseReason::new(CloseCode::Away, "endpoint disposed"));
    }

    let grace = Duration::from_millis(inner.config.dispose_grace_ms);
    if tokio::time::timeout(grace, endpoint.tracker.wait_empty())
        .await
        .is_err()
    {
        warn!(
            path = endpoint.descriptor.template.path(),
            abandoned = endpoint.tracker.len(),
            "grace period elapsed; abandoning remaining sessions"
        );
    }

    endpoint.descriptor.codecs.destroy();
}
