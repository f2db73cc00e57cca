//! Per-connection dispatch.
//!
//! Each accepted connection runs one task consuming an ordered event queue,
//! so all callbacks for a session are serialized in arrival order while
//! distinct sessions progress in parallel.  The loop wraps the queue receive
//! in the session's idle timeout, re-read every iteration so runtime
//! changes take effect.
//!
//! Failure routing:
//! - decode failures and non-fatal handler failures go to the error
//!   callback and the connection stays open;
//! - encode failures during auto-reply go to the error callback (the reply
//!   has no other caller);
//! - protocol violations close 1002/1007, overflow closes 1009, fatal
//!   handler failures close 1011;
//! - transport teardown routes the error callback (when a cause is known)
//!   and then the close callback.
//!
//! The close sequence is always: error callback (failure-caused closes
//! only), close callback, tracker removal, close request out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ws_proto::{CloseCode, CloseReason, Frame, OpCode, parse_close_payload};

use crate::assembler::{Assembled, AssemblyError, AssemblyLimits, MessageAssembler};
use crate::descriptor::{BindValues, CompiledCallback, EndpointDescriptor, MessageValue};
use crate::endpoint::{HandlerState, MessageShape, Reply};
use crate::error::{CodecError, DispatchError, SendError};
use crate::registry::{RegisteredEndpoint, ServerInner};
use crate::session::Session;
use crate::transport::{ConnectionId, TransportHandle};

/// Events of one connection, consumed in arrival order.
pub(crate) enum ConnEvent {
    Frame(Frame),
    UserClose(CloseReason),
    TransportClosed(Option<String>),
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Connection {
    pub(crate) conn_id: ConnectionId,
    pub(crate) server: Arc<ServerInner>,
    pub(crate) endpoint: Arc<RegisteredEndpoint>,
    pub(crate) descriptor: Arc<EndpointDescriptor>,
    pub(crate) session: Arc<Session>,
    pub(crate) state: HandlerState,
    pub(crate) assembler: MessageAssembler,
    pub(crate) events: mpsc::UnboundedReceiver<ConnEvent>,
    pub(crate) transport: TransportHandle,
}

impl Connection {
    pub(crate) async fn run(mut self) {
        self.endpoint.tracker.insert(Arc::clone(&self.session));
        info!(
            session_id = %self.session.id(),
            path = self.descriptor.template.path(),
            "session opened"
        );

        if self.invoke_open() == Flow::Stop {
            return;
        }

        loop {
            let idle = self.session.max_idle_timeout_ms();
            let event = if idle > 0 {
                match tokio::time::timeout(Duration::from_millis(idle), self.events.recv()).await
                {
                    Ok(event) => event,
                    Err(_) => {
                        debug!(session_id = %self.session.id(), "idle timeout elapsed");
                        self.finish(
                            CloseReason::new(CloseCode::Normal, "idle timeout"),
                            None,
                            true,
                        );
                        return;
                    }
                }
            } else {
                self.events.recv().await
            };

            let flow = match event {
                Some(ConnEvent::Frame(frame)) => self.handle_frame(frame).await,
                Some(ConnEvent::UserClose(reason)) => {
                    self.finish(reason, None, true);
                    Flow::Stop
                }
                Some(ConnEvent::TransportClosed(cause)) => {
                    let failure = cause
                        .map(|c| Arc::new(DispatchError::Transport(c)));
                    self.finish(
                        CloseReason::new(CloseCode::Abnormal, "transport closed"),
                        failure,
                        false,
                    );
                    Flow::Stop
                }
                None => {
                    self.finish(
                        CloseReason::new(CloseCode::Away, "server shutting down"),
                        None,
                        false,
                    );
                    Flow::Stop
                }
            };
            if flow == Flow::Stop {
                return;
            }
        }
    }

    // -- open --

    fn invoke_open(&mut self) -> Flow {
        let descriptor = Arc::clone(&self.descriptor);
        let Some(callback) = descriptor.open.as_ref() else {
            return Flow::Continue;
        };
        let bound = callback.bind(BindValues {
            session: &self.session,
            config: &descriptor.config,
            close_reason: None,
            cause: None,
            message: None,
            last: false,
        });
        match bound {
            Ok(args) => match (callback.invoke)(self.state.as_mut(), &args) {
                Ok(_) => Flow::Continue,
                Err(e) if e.is_fatal() => {
                    self.finish(
                        CloseReason::new(CloseCode::Error, "open callback failure"),
                        Some(Arc::new(DispatchError::Handler(e))),
                        true,
                    );
                    Flow::Stop
                }
                Err(e) => {
                    self.route_error(Arc::new(DispatchError::Handler(e)));
                    Flow::Continue
                }
            },
            Err(e) => {
                self.route_error(Arc::new(e));
                Flow::Continue
            }
        }
    }

    // -- frames --

    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        if let Err(e) = frame.check_control_rules() {
            self.finish(
                CloseReason::new(CloseCode::Protocol, e.to_string()),
                None,
                true,
            );
            return Flow::Stop;
        }

        match frame.opcode {
            OpCode::Ping => {
                // Echo the application data back; no ack needed.
                let _ = self.transport.send_frame(Frame::pong(frame.payload), None);
                Flow::Continue
            }
            OpCode::Pong => self.dispatch_pong(frame.payload).await,
            OpCode::Close => match parse_close_payload(&frame.payload) {
                Ok(reason) => {
                    self.finish(reason, None, true);
                    Flow::Stop
                }
                Err(e) => {
                    self.finish(
                        CloseReason::new(CloseCode::Protocol, e.to_string()),
                        None,
                        true,
                    );
                    Flow::Stop
                }
            },
            OpCode::Bad(op) => {
                self.finish(
                    CloseReason::new(CloseCode::Protocol, format!("reserved opcode {op:#x}")),
                    None,
                    true,
                );
                Flow::Stop
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                self.handle_data(frame).await
            }
        }
    }

    async fn handle_data(&mut self, frame: Frame) -> Flow {
        let descriptor = Arc::clone(&self.descriptor);
        let limits = AssemblyLimits {
            text_limit: self.session.max_text_message_buffer_size(),
            binary_limit: self.session.max_binary_message_buffer_size(),
            text_partial: descriptor.text.as_ref().is_some_and(|c| c.partial),
            binary_partial: descriptor.binary.as_ref().is_some_and(|c| c.partial),
        };

        match self
            .assembler
            .on_frame(frame.opcode, frame.fin, frame.payload, &limits)
        {
            Ok(Assembled::Pending) => Flow::Continue,
            Ok(Assembled::Text(text)) => self.dispatch_text(text, true).await,
            Ok(Assembled::TextFragment { data, last }) => self.dispatch_text(data, last).await,
            Ok(Assembled::Binary(data)) => self.dispatch_binary(data, true).await,
            Ok(Assembled::BinaryFragment { data, last }) => {
                self.dispatch_binary(data, last).await
            }
            Err(AssemblyError::Protocol(message)) => {
                self.finish(
                    CloseReason::new(CloseCode::Protocol, message),
                    None,
                    true,
                );
                Flow::Stop
            }
            Err(AssemblyError::InvalidUtf8) => {
                self.finish(
                    CloseReason::new(CloseCode::Invalid, "text message is not valid UTF-8"),
                    None,
                    true,
                );
                Flow::Stop
            }
            Err(AssemblyError::Overflow { kind, limit }) => {
                self.finish(
                    CloseReason::new(
                        CloseCode::Size,
                        format!("{} message exceeds {limit} bytes", kind.word()),
                    ),
                    None,
                    true,
                );
                Flow::Stop
            }
        }
    }

    // -- message dispatch --

    async fn dispatch_text(&mut self, text: String, last: bool) -> Flow {
        let descriptor = Arc::clone(&self.descriptor);
        let Some(callback) = descriptor.text.as_ref() else {
            debug!(session_id = %self.session.id(), "text message with no text callback");
            return Flow::Continue;
        };

        let message = match callback.shape {
            Some(MessageShape::Text | MessageShape::Reader) => MessageValue::Text(text),
            Some(MessageShape::Primitive(target)) => match target.parse(&text) {
                Ok(value) => MessageValue::Object(value),
                Err(e) => {
                    self.route_error(Arc::new(DispatchError::Decode(e)));
                    return Flow::Continue;
                }
            },
            Some(MessageShape::Custom { type_id, type_name }) => {
                match descriptor.codecs.decode_text(type_id, type_name, &text) {
                    Ok(value) => MessageValue::Object(value),
                    Err(e) => {
                        self.route_error(Arc::new(e));
                        return Flow::Continue;
                    }
                }
            }
            _ => return Flow::Continue,
        };

        self.run_message_callback(callback, message, last).await
    }

    async fn dispatch_binary(&mut self, data: Vec<u8>, last: bool) -> Flow {
        let descriptor = Arc::clone(&self.descriptor);
        let Some(callback) = descriptor.binary.as_ref() else {
            debug!(session_id = %self.session.id(), "binary message with no binary callback");
            return Flow::Continue;
        };

        let message = match callback.shape {
            Some(
                MessageShape::Binary | MessageShape::BinaryArray | MessageShape::InputStream,
            ) => MessageValue::Binary(data),
            Some(MessageShape::Custom { type_id, type_name }) => {
                match descriptor.codecs.decode_binary(type_id, type_name, &data) {
                    Ok(value) => MessageValue::Object(value),
                    Err(e) => {
                        self.route_error(Arc::new(e));
                        return Flow::Continue;
                    }
                }
            }
            _ => return Flow::Continue,
        };

        self.run_message_callback(callback, message, last).await
    }

    async fn dispatch_pong(&mut self, payload: Vec<u8>) -> Flow {
        let descriptor = Arc::clone(&self.descriptor);
        let Some(callback) = descriptor.pong.as_ref() else {
            return Flow::Continue;
        };
        self.run_message_callback(callback, MessageValue::Pong(payload), true)
            .await
    }

    async fn run_message_callback(
        &mut self,
        callback: &CompiledCallback,
        message: MessageValue,
        last: bool,
    ) -> Flow {
        let descriptor = Arc::clone(&self.descriptor);
        let bound = callback.bind(BindValues {
            session: &self.session,
            config: &descriptor.config,
            close_reason: None,
            cause: None,
            message: Some(message),
            last,
        });
        let args = match bound {
            Ok(args) => args,
            Err(e) => {
                self.route_error(Arc::new(e));
                return Flow::Continue;
            }
        };

        match (callback.invoke)(self.state.as_mut(), &args) {
            Ok(reply) => self.auto_reply(reply).await,
            Err(e) if e.is_fatal() => {
                self.finish(
                    CloseReason::new(CloseCode::Error, "handler failure"),
                    Some(Arc::new(DispatchError::Handler(e))),
                    true,
                );
                Flow::Stop
            }
            Err(e) => {
                self.route_error(Arc::new(DispatchError::Handler(e)));
                Flow::Continue
            }
        }
    }

    /// Route a non-`None` callback return back to the peer.
    async fn auto_reply(&mut self, reply: Reply) -> Flow {
        let outcome = match reply {
            Reply::None => return Flow::Continue,
            Reply::Text(text) => self.session.start_text(&text).await,
            Reply::Binary(data) => self.session.start_binary(&data).await,
            Reply::Object { value, type_name } => {
                self.session.start_object_boxed(value, type_name).await
            }
        };
        if let Err(e) = outcome {
            let cause = match &e {
                SendError::NoEncoder(_) | SendError::Encoder(_) => {
                    DispatchError::Encode(CodecError::new(e.to_string()))
                }
                _ => DispatchError::Transport(e.to_string()),
            };
            self.route_error(Arc::new(cause));
        }
        Flow::Continue
    }

    // -- failure routing --

    /// Offer a failure to the error callback.  A failure inside the error
    /// callback itself is logged and swallowed.
    fn route_error(&mut self, cause: Arc<DispatchError>) {
        warn!(
            session_id = %self.session.id(),
            cause = %cause,
            "routing failure to error callback"
        );
        let descriptor = Arc::clone(&self.descriptor);
        let Some(callback) = descriptor.error.as_ref() else {
            return;
        };
        let bound = callback.bind(BindValues {
            session: &self.session,
            config: &descriptor.config,
            close_reason: None,
            cause: Some(&cause),
            message: None,
            last: false,
        });
        match bound {
            Ok(args) => {
                if let Err(e) = (callback.invoke)(self.state.as_mut(), &args) {
                    error!(
                        session_id = %self.session.id(),
                        error = %e,
                        "error callback failed; swallowing"
                    );
                }
            }
            Err(e) => {
                error!(
                    session_id = %self.session.id(),
                    error = %e,
                    "could not bind error callback arguments"
                );
            }
        }
    }

    // -- close sequencing --

    /// Drive the terminal transition: error callback for failure-caused
    /// closes, close callback, close request out, tracker removal.
    fn finish(
        &mut self,
        reason: CloseReason,
        failure: Option<Arc<DispatchError>>,
        send_close: bool,
    ) {
        if self.session.state() != crate::session::SessionState::Open {
            return;
        }
        self.session.set_state(crate::session::SessionState::Closing);
        self.assembler.reset();

        if let Some(cause) = failure {
            self.route_error(cause);
        }

        let descriptor = Arc::clone(&self.descriptor);
        if let Some(callback) = descriptor.close.as_ref() {
            let bound = callback.bind(BindValues {
                session: &self.session,
                config: &descriptor.config,
                close_reason: Some(&reason),
                cause: None,
                message: None,
                last: false,
            });
            match bound {
                Ok(args) => {
                    if let Err(e) = (callback.invoke)(self.state.as_mut(), &args) {
                        self.route_error(Arc::new(DispatchError::Handler(e)));
                    }
                }
                Err(e) => self.route_error(Arc::new(e)),
            }
        }

        self.session.set_state(crate::session::SessionState::Closed);
        self.endpoint.tracker.remove(self.session.id());
        self.server.forget_connection(&self.conn_id);

        // Only after the terminal transition is observable: a transport that
        // reacts to the close request instantly must still find the tracker
        // already drained of this session.
        if send_close {
            self.transport
                .request_close(reason.code, reason.reason.clone());
        }

        info!(
            session_id = %self.session.id(),
            code = u16::from(reason.code),
            "session closed"
        );
    }
}
