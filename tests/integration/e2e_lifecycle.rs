//! End-to-End: session and endpoint lifecycle.
//!
//! # Coverage
//! - Endpoint dispose: live sessions close 1001, the tracker drains within
//!   the grace period, codecs are destroyed exactly once.
//! - Close idempotence: a second session close is a no-op.
//! - Idle timeout closes 1000 (paused-clock test).
//! - Ping frames echo a pong with the same application data; pong frames
//!   reach the pong callback.
//! - Fatal handler failures close 1011 after the error callback; non-fatal
//!   ones leave the connection open; a failing error callback is swallowed.
//! - The session surface reports its handshake context.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ws_core::{
    Codec, CodecError, Decoder, Endpoint, HandlerError, MessageShape, Param, Reply, Server,
    ServerConfig, Session, SessionState, TextDecoder, UpgradeRequest,
};
use ws_proto::CloseCode;
use ws_test_utils::MockTransport;

fn quiet_endpoint(path: &str) -> Endpoint {
    Endpoint::builder(path, || ())
        .on_message(vec![Param::message(MessageShape::Text)], |_, args| {
            Ok(Reply::Text(args.text(0).unwrap_or("").to_owned()))
        })
        .build()
}

#[tokio::test]
async fn dispose_closes_live_sessions_and_drains_the_tracker() {
    let server = Server::default();
    let handle = server
        .register(quiet_endpoint("/doomed"))
        .expect("registers");

    let mut client_a = MockTransport::connect(&server, "/doomed").expect("upgrade A");
    let mut client_b = MockTransport::connect(&server, "/doomed").expect("upgrade B");

    // Round-trip both sessions so their open sequences have completed
    // before the dispose fans out.
    client_a.send_text("sync");
    assert_eq!(client_a.expect_text().await, "sync");
    client_b.send_text("sync");
    assert_eq!(client_b.expect_text().await, "sync");

    handle.dispose().await;

    let (code_a, _) = client_a.expect_close().await;
    let (code_b, _) = client_b.expect_close().await;
    assert_eq!(code_a, CloseCode::Away);
    assert_eq!(code_b, CloseCode::Away);
    assert_eq!(handle.open_session_count(), 0);

    // Idempotent.
    handle.dispose().await;
}

struct LifecycleProbe {
    inits: Arc<AtomicUsize>,
    destroys: Arc<AtomicUsize>,
}

impl Codec for LifecycleProbe {
    fn target(&self) -> TypeId {
        TypeId::of::<String>()
    }

    fn init(&self, _config: &ws_core::EndpointConfig) {
        self.inits.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

impl TextDecoder for LifecycleProbe {
    fn will_decode(&self, _raw: &str) -> bool {
        true
    }

    fn decode(&self, raw: &str) -> Result<Box<dyn Any + Send>, CodecError> {
        Ok(Box::new(raw.to_owned()))
    }
}

#[tokio::test]
async fn codecs_init_on_register_and_destroy_on_dispose() {
    let inits = Arc::new(AtomicUsize::new(0));
    let destroys = Arc::new(AtomicUsize::new(0));

    let server = Server::default();
    let endpoint = Endpoint::builder("/codec", || ())
        .decoder(Decoder::Text(Arc::new(LifecycleProbe {
            inits: Arc::clone(&inits),
            destroys: Arc::clone(&destroys),
        })))
        .on_message(
            vec![Param::message(MessageShape::custom::<String>())],
            |_, args| {
                Ok(Reply::Text(
                    args.object_as::<String>(0).cloned().unwrap_or_default(),
                ))
            },
        )
        .build();
    let handle = server.register(endpoint).expect("registers");
    assert_eq!(inits.load(Ordering::SeqCst), 1);
    assert_eq!(destroys.load(Ordering::SeqCst), 0);

    let mut client = MockTransport::connect(&server, "/codec").expect("upgrade");
    client.send_text("through");
    assert_eq!(client.expect_text().await, "through");

    handle.dispose().await;
    assert_eq!(destroys.load(Ordering::SeqCst), 1);

    handle.dispose().await;
    assert_eq!(destroys.load(Ordering::SeqCst), 1, "destroy runs once");
}

type SessionSlot = Arc<Mutex<Option<Arc<Session>>>>;

fn capture_endpoint(path: &str, slot: SessionSlot) -> Endpoint {
    Endpoint::builder(path, || ())
        .on_open(vec![Param::Session], move |_, args| {
            *slot.lock().expect("slot lock") = args.session().cloned();
            Ok(())
        })
        .on_message(vec![Param::message(MessageShape::Text)], |_, args| {
            Ok(Reply::Text(args.text(0).unwrap_or("").to_owned()))
        })
        .build()
}

#[tokio::test]
async fn session_close_is_idempotent() {
    let slot: SessionSlot = Arc::new(Mutex::new(None));
    let server = Server::default();
    server
        .register(capture_endpoint("/once", Arc::clone(&slot)))
        .expect("registers");

    let mut client = MockTransport::connect(&server, "/once").expect("upgrade");
    client.send_text("sync");
    assert_eq!(client.expect_text().await, "sync");

    let session = slot.lock().expect("slot lock").clone().expect("captured");
    session.close();
    session.close();

    let (code, _) = client.expect_close().await;
    assert_eq!(code, CloseCode::Normal);
    assert_eq!(session.state(), SessionState::Closed);

    // The second close produced no extra close request.
    client.expect_silence(100).await;

    // And closing a closed session remains a no-op.
    session.close();
    client.expect_silence(100).await;
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_closes_with_1000() {
    let server = Server::new(ServerConfig {
        max_idle_timeout_ms: 50,
        ..ServerConfig::default()
    });
    server.register(quiet_endpoint("/idle")).expect("registers");

    let mut client = MockTransport::connect(&server, "/idle").expect("upgrade");
    let (code, reason) = client.expect_close().await;
    assert_eq!(code, CloseCode::Normal);
    assert_eq!(reason, "idle timeout");
}

#[tokio::test]
async fn ping_echoes_pong_with_identical_payload() {
    let server = Server::default();
    server.register(quiet_endpoint("/ping")).expect("registers");

    let mut client = MockTransport::connect(&server, "/ping").expect("upgrade");
    client.send_ping(&[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(client.expect_pong().await, vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[tokio::test]
async fn pong_frames_reach_the_pong_callback() {
    let server = Server::default();
    let endpoint = Endpoint::builder("/heartbeat", || ())
        .on_message(vec![Param::message(MessageShape::Pong)], |_, args| {
            Ok(Reply::Text(format!(
                "pong:{}",
                args.pong(0).map(<[u8]>::len).unwrap_or(0)
            )))
        })
        .build();
    server.register(endpoint).expect("registers");

    let mut client = MockTransport::connect(&server, "/heartbeat").expect("upgrade");
    client.send_pong(b"beat");
    assert_eq!(client.expect_text().await, "pong:4");
}

#[tokio::test]
async fn fatal_handler_failures_close_1011_after_the_error_callback() {
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);

    let server = Server::default();
    let endpoint = Endpoint::builder("/fatal", || ())
        .on_message(vec![Param::message(MessageShape::Text)], |_, args| {
            match args.text(0) {
                Some("die") => Err(HandlerError::fatal("cannot continue")),
                Some(other) => Err(HandlerError::new(format!("soft: {other}"))),
                None => Ok(Reply::None),
            }
        })
        .on_error(vec![Param::Cause], move |_, args| {
            if let Some(cause) = args.cause() {
                sink.lock().expect("error log").push(cause.to_string());
            }
            Ok(())
        })
        .build();
    server.register(endpoint).expect("registers");

    let mut client = MockTransport::connect(&server, "/fatal").expect("upgrade");

    // Non-fatal: error callback runs, connection survives.
    client.send_text("oops");
    client.send_ping(b"alive");
    assert_eq!(client.expect_pong().await, b"alive");
    assert_eq!(errors.lock().expect("error log").len(), 1);

    // Fatal: error callback runs, then 1011.
    client.send_text("die");
    let (code, _) = client.expect_close().await;
    assert_eq!(code, CloseCode::Error);
    assert_eq!(errors.lock().expect("error log").len(), 2);
}

#[tokio::test]
async fn failing_error_callback_is_swallowed() {
    let server = Server::default();
    let endpoint = Endpoint::builder("/cranky", || ())
        .on_message(vec![Param::message(MessageShape::Text)], |_, _| {
            Err(HandlerError::new("always fails"))
        })
        .on_error(vec![Param::Cause], |_, _| {
            Err(HandlerError::new("error callback also fails"))
        })
        .build();
    server.register(endpoint).expect("registers");

    let mut client = MockTransport::connect(&server, "/cranky").expect("upgrade");
    client.send_text("first");
    client.send_text("second");

    // Both failures were swallowed; the connection still answers control
    // traffic.
    client.send_ping(b"ok");
    assert_eq!(client.expect_pong().await, b"ok");
}

#[tokio::test]
async fn transport_death_routes_error_then_close() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let error_log = Arc::clone(&log);
    let close_log = Arc::clone(&log);

    let server = Server::default();
    let endpoint = Endpoint::builder("/flaky", || ())
        .on_message(vec![Param::message(MessageShape::Text)], |_, args| {
            Ok(Reply::Text(args.text(0).unwrap_or("").to_owned()))
        })
        .on_error(vec![Param::Cause], move |_, args| {
            if let Some(cause) = args.cause() {
                error_log
                    .lock()
                    .expect("log lock")
                    .push(format!("error:{cause}"));
            }
            Ok(())
        })
        .on_close(vec![Param::CloseReason], move |_, args| {
            let code = args
                .close_reason()
                .map(|r| u16::from(r.code))
                .unwrap_or_default();
            close_log
                .lock()
                .expect("log lock")
                .push(format!("close:{code}"));
            Ok(())
        })
        .build();
    server.register(endpoint).expect("registers");

    let mut client = MockTransport::connect(&server, "/flaky").expect("upgrade");
    client.send_text("sync");
    assert_eq!(client.expect_text().await, "sync");

    client.transport_closed(Some("connection reset by peer"));
    // No close request goes out to a dead transport; poll the log instead.
    for _ in 0..50 {
        if log.lock().expect("log lock").len() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let log = log.lock().expect("log lock");
    assert_eq!(log.len(), 2, "got: {log:?}");
    assert!(log[0].starts_with("error:transport failure"), "got: {}", log[0]);
    assert_eq!(log[1], "close:1006");
}

#[tokio::test]
async fn server_shutdown_disposes_every_endpoint() {
    let server = Server::default();
    server.register(quiet_endpoint("/one")).expect("registers");
    server.register(quiet_endpoint("/two")).expect("registers");

    let mut client_one = MockTransport::connect(&server, "/one").expect("upgrade");
    let mut client_two = MockTransport::connect(&server, "/two").expect("upgrade");
    client_one.send_text("sync");
    assert_eq!(client_one.expect_text().await, "sync");
    client_two.send_text("sync");
    assert_eq!(client_two.expect_text().await, "sync");

    server.shutdown().await;

    let (code_one, _) = client_one.expect_close().await;
    let (code_two, _) = client_two.expect_close().await;
    assert_eq!(code_one, CloseCode::Away);
    assert_eq!(code_two, CloseCode::Away);
    assert!(MockTransport::connect(&server, "/one").is_err());
    assert!(MockTransport::connect(&server, "/two").is_err());
}

struct NoteHandler;

impl ws_core::MessageHandler for NoteHandler {}

#[tokio::test]
async fn session_surface_reports_handshake_context() {
    let slot: SessionSlot = Arc::new(Mutex::new(None));
    let server = Server::default();
    server
        .register(capture_endpoint("/ctx/{room}", Arc::clone(&slot)))
        .expect("registers");

    let mut request = UpgradeRequest::new("/ctx/lobby?user=ada&tag=a&tag=b");
    request.secure = true;
    request.principal = Some("ada".to_owned());
    let mut client = MockTransport::connect_with(&server, request).expect("upgrade");
    client.send_text("sync");
    assert_eq!(client.expect_text().await, "sync");

    let session = slot.lock().expect("slot lock").clone().expect("captured");
    assert_eq!(session.protocol_version(), "13");
    assert!(session.is_secure());
    assert_eq!(session.user_principal(), Some("ada"));
    assert_eq!(session.request_uri(), "/ctx/lobby?user=ada&tag=a&tag=b");
    assert_eq!(session.query_string(), Some("user=ada&tag=a&tag=b"));
    assert_eq!(session.path_params().get("room"), Some("lobby"));
    assert_eq!(
        session.request_parameter_map().get("tag"),
        Some(&vec!["a".to_owned(), "b".to_owned()])
    );
    assert!(!session.id().is_empty());

    // Opaque handler set: store, count, enumerate, remove.
    let handler: Arc<dyn ws_core::MessageHandler> = Arc::new(NoteHandler);
    session.add_message_handler(Arc::clone(&handler));
    assert_eq!(session.message_handlers().len(), 1);
    session.remove_message_handler(&handler);
    assert!(session.message_handlers().is_empty());
}
