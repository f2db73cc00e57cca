// mock_transport: A mock framing collaborator for driving a Server in
// tests.
//
// Plays the transport side of the engine's seam: performs the upgrade,
// injects inbound frames (whole, fragmented, control), and drains the
// outbound command channel, acknowledging writes so ack-awaited sends
// resolve.
//
// # Behavior
//
// - `connect` performs `on_upgrade` with a plain request; `connect_with`
//   accepts a prepared `UpgradeRequest` (subprotocols, TLS flag,
//   principal).
// - Every outbound `SendFrame` is acknowledged with `Ok(())` as it is
//   received, unless auto-ack is turned off.
// - All receive helpers time out rather than hang; `expect_*` helpers
//   panic with a descriptive message on mismatch so test failures read
//   well.

use std::time::Duration;

use tokio::sync::mpsc;
use ws_core::{ConnectionId, Server, TransportCommand, TransportHandle, UpgradeError, UpgradeRequest};
use ws_proto::{CloseCode, CloseReason, Frame, OpCode, encode_close_payload};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MockTransport {
    server: Server,
    conn_id: ConnectionId,
    subprotocol: Option<String>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    auto_ack: bool,
}

impl MockTransport {
    /// Upgrade a plain connection at `uri` against the server.
    pub fn connect(server: &Server, uri: &str) -> Result<Self, UpgradeError> {
        Self::connect_with(server, UpgradeRequest::new(uri))
    }

    /// Upgrade with a prepared handshake context.
    pub fn connect_with(server: &Server, request: UpgradeRequest) -> Result<Self, UpgradeError> {
        let (handle, commands) = TransportHandle::channel();
        let accept = server.on_upgrade(request, handle)?;
        Ok(MockTransport {
            server: server.clone(),
            conn_id: accept.connection_id,
            subprotocol: accept.subprotocol,
            commands,
            auto_ack: true,
        })
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    /// Subprotocol the upgrade echoed, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Stop acknowledging writes; ack-awaited sends will then hang until
    /// the transport drops (exercising transport-failure paths).
    pub fn set_auto_ack(&mut self, auto_ack: bool) {
        self.auto_ack = auto_ack;
    }

    // -- inbound driving --

    pub fn send_frame(&self, frame: Frame) {
        self.server.on_frame(&self.conn_id, frame);
    }

    pub fn send_text(&self, text: &str) {
        self.send_frame(Frame::text(text));
    }

    pub fn send_binary(&self, data: &[u8]) {
        self.send_frame(Frame::binary(data.to_vec()));
    }

    /// Send a text message split into the given fragments.
    pub fn send_fragmented_text(&self, fragments: &[&str]) {
        for (index, fragment) in fragments.iter().enumerate() {
            let last = index == fragments.len() - 1;
            let opcode = if index == 0 {
                OpCode::Text
            } else {
                OpCode::Continuation
            };
            self.send_frame(Frame {
                opcode,
                fin: last,
                payload: fragment.as_bytes().to_vec(),
            });
        }
    }

    /// Send a binary message split into the given fragments.
    pub fn send_fragmented_binary(&self, fragments: &[&[u8]]) {
        for (index, fragment) in fragments.iter().enumerate() {
            let last = index == fragments.len() - 1;
            let opcode = if index == 0 {
                OpCode::Binary
            } else {
                OpCode::Continuation
            };
            self.send_frame(Frame {
                opcode,
                fin: last,
                payload: fragment.to_vec(),
            });
        }
    }

    /// Send a bare continuation frame (protocol-error driving).
    pub fn send_continuation(&self, data: &[u8], fin: bool) {
        self.send_frame(Frame::continuation(data.to_vec(), fin));
    }

    pub fn send_ping(&self, payload: &[u8]) {
        self.send_frame(Frame::ping(payload.to_vec()));
    }

    pub fn send_pong(&self, payload: &[u8]) {
        self.send_frame(Frame::pong(payload.to_vec()));
    }

    /// Send a close frame from the peer.
    pub fn send_close(&self, code: CloseCode, reason: &str) {
        self.send_frame(Frame {
            opcode: OpCode::Close,
            fin: true,
            payload: encode_close_payload(&CloseReason::new(code, reason)),
        });
    }

    /// Signal that the underlying connection died.
    pub fn transport_closed(&self, cause: Option<&str>) {
        self.server
            .on_transport_closed(&self.conn_id, cause.map(ToOwned::to_owned));
    }

    // -- outbound observation --

    /// Next outbound command, acking writes; `None` on timeout.
    pub async fn recv_command(&mut self) -> Option<TransportCommand> {
        match tokio::time::timeout(RECV_TIMEOUT, self.commands.recv()).await {
            Ok(Some(TransportCommand::SendFrame { frame, ack })) => {
                let ack = if self.auto_ack {
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                    None
                } else {
                    ack
                };
                Some(TransportCommand::SendFrame { frame, ack })
            }
            Ok(other) => other,
            Err(_) => None,
        }
    }

    /// Next outbound frame; panics on close requests or timeout.
    pub async fn expect_frame(&mut self) -> Frame {
        match self.recv_command().await {
            Some(TransportCommand::SendFrame { frame, .. }) => frame,
            Some(TransportCommand::RequestClose { code, reason }) => panic!(
                "expected a frame, got close request {} ({reason})",
                u16::from(code)
            ),
            None => panic!("expected a frame, got nothing within {RECV_TIMEOUT:?}"),
        }
    }

    /// Next outbound frame as text; panics on anything else.
    pub async fn expect_text(&mut self) -> String {
        let frame = self.expect_frame().await;
        assert_eq!(frame.opcode, OpCode::Text, "expected a text frame");
        String::from_utf8(frame.payload).expect("text frame payload must be UTF-8")
    }

    /// Next outbound frame as binary payload; panics on anything else.
    pub async fn expect_binary(&mut self) -> Vec<u8> {
        let frame = self.expect_frame().await;
        assert_eq!(frame.opcode, OpCode::Binary, "expected a binary frame");
        frame.payload
    }

    /// Next outbound frame as pong payload; panics on anything else.
    pub async fn expect_pong(&mut self) -> Vec<u8> {
        let frame = self.expect_frame().await;
        assert_eq!(frame.opcode, OpCode::Pong, "expected a pong frame");
        frame.payload
    }

    /// Next outbound command as a close request, returning code and reason.
    pub async fn expect_close(&mut self) -> (CloseCode, String) {
        match self.recv_command().await {
            Some(TransportCommand::RequestClose { code, reason }) => (code, reason),
            Some(TransportCommand::SendFrame { frame, .. }) => {
                panic!("expected a close request, got frame {:?}", frame.opcode)
            }
            None => panic!("expected a close request, got nothing within {RECV_TIMEOUT:?}"),
        }
    }

    /// Assert that nothing is sent for `ms` milliseconds.
    pub async fn expect_silence(&mut self, ms: u64) {
        match tokio::time::timeout(Duration::from_millis(ms), self.commands.recv()).await {
            Err(_) => {}
            Ok(Some(TransportCommand::SendFrame { frame, .. })) => {
                panic!("expected silence, got frame {:?}", frame.opcode)
            }
            Ok(Some(TransportCommand::RequestClose { code, .. })) => {
                panic!("expected silence, got close request {}", u16::from(code))
            }
            Ok(None) => {}
        }
    }
}
