//! The seam between the engine and the framing collaborator.
//!
//! Inbound, the transport calls `Server::on_upgrade`, `Server::on_frame`,
//! and `Server::on_transport_closed`.  Outbound, the engine pushes
//! [`TransportCommand`]s onto the channel behind a [`TransportHandle`] the
//! transport supplied at upgrade time.  Write acknowledgement travels back
//! over a oneshot per frame; remotes complete on it.

use std::fmt;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use ws_proto::{CloseCode, Frame};

/// Opaque identifier the transport uses to address one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub(crate) fn fresh() -> Self {
        ConnectionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Completion signal for one written frame.
pub type WriteAck = oneshot::Sender<std::io::Result<()>>;

/// What the engine asks of the transport.
pub enum TransportCommand {
    /// Write a frame.  When `ack` is present, resolve it once the write is
    /// acknowledged (or failed); senders are awaiting it.
    SendFrame {
        frame: Frame,
        ack: Option<WriteAck>,
    },
    /// Perform the closing handshake with the given code and reason, then
    /// tear the connection down.
    RequestClose { code: CloseCode, reason: String },
}

/// Sending side of a connection's command channel, supplied by the
/// transport at upgrade time.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(tx: mpsc::UnboundedSender<TransportCommand>) -> Self {
        TransportHandle { tx }
    }

    /// Build a handle together with the receiving end the transport drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportHandle { tx }, rx)
    }

    /// Push a frame; `Err` means the transport went away.
    pub(crate) fn send_frame(&self, frame: Frame, ack: Option<WriteAck>) -> Result<(), ()> {
        self.tx
            .send(TransportCommand::SendFrame { frame, ack })
            .map_err(|_| ())
    }

    pub(crate) fn request_close(&self, code: CloseCode, reason: String) {
        let _ = self.tx.send(TransportCommand::RequestClose { code, reason });
    }
}

/// Handshake context the transport extracted from the HTTP upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request URI including any query component.
    pub uri: String,
    /// Subprotocols the client offered, in offer order.
    pub offered_subprotocols: Vec<String>,
    /// Whether the connection arrived over TLS.
    pub secure: bool,
    /// Authenticated principal, if the handshake established one.
    pub principal: Option<String>,
}

impl UpgradeRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        UpgradeRequest {
            uri: uri.into(),
            offered_subprotocols: Vec::new(),
            secure: false,
            principal: None,
        }
    }
}

/// Outcome of a successful upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeAccept {
    pub connection_id: ConnectionId,
    /// Subprotocol to echo in the handshake response, if any.
    pub subprotocol: Option<String>,
}
