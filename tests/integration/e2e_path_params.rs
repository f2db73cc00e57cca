//! End-to-End: path-parameter capture and binding.
//!
//! # Coverage
//! - Template `/p/{id}`: the captured value is available in the open
//!   callback and in message callbacks.
//! - Typed targets: a numeric path parameter arrives parsed.
//! - A declared name with no template variable binds null.
//! - A path parameter that fails to parse at dispatch is a decode failure:
//!   error callback runs, the connection stays open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ws_core::{Endpoint, MessageShape, Param, PathTarget, Reply, Server};
use ws_test_utils::MockTransport;

#[tokio::test]
async fn captured_id_flows_into_open_and_message_callbacks() {
    #[derive(Default)]
    struct Held {
        id: String,
    }

    let server = Server::default();
    let endpoint = Endpoint::builder("/p/{id}", Held::default)
        .on_open(
            vec![Param::Session, Param::path_param("id", PathTarget::Str)],
            |state: &mut Held, args| {
                state.id = args
                    .path_param_as::<String>("id")
                    .cloned()
                    .unwrap_or_default();
                Ok(())
            },
        )
        .on_message(
            vec![Param::message(MessageShape::Text)],
            |state: &mut Held, _| Ok(Reply::Text(state.id.clone())),
        )
        .build();
    server.register(endpoint).expect("endpoint registers");

    let mut client = MockTransport::connect(&server, "/p/42").expect("upgrade");
    client.send_text("anything");
    assert_eq!(client.expect_text().await, "42");

    client.send_text("again");
    assert_eq!(client.expect_text().await, "42");
}

#[tokio::test]
async fn numeric_targets_arrive_parsed() {
    let server = Server::default();
    let endpoint = Endpoint::builder("/n/{num}", || ())
        .on_message(
            vec![
                Param::message(MessageShape::Text),
                Param::path_param("num", PathTarget::I64),
            ],
            |_, args| {
                let num = args.path_param_as::<i64>("num").copied().unwrap_or(0);
                Ok(Reply::Text((num + 1).to_string()))
            },
        )
        .build();
    server.register(endpoint).expect("endpoint registers");

    let mut client = MockTransport::connect(&server, "/n/41").expect("upgrade");
    client.send_text("bump");
    assert_eq!(client.expect_text().await, "42");
}

#[tokio::test]
async fn undeclared_name_binds_null() {
    let saw_null = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&saw_null);

    let server = Server::default();
    let endpoint = Endpoint::builder("/q/{present}", || ())
        .on_open(
            vec![Param::path_param("absent", PathTarget::Str)],
            move |_, args| {
                observed.store(
                    matches!(args.path_param("absent"), Some(None)),
                    Ordering::SeqCst,
                );
                Ok(())
            },
        )
        .on_message(vec![Param::message(MessageShape::Text)], |_, _| {
            Ok(Reply::Text("ok".to_owned()))
        })
        .build();
    server.register(endpoint).expect("endpoint registers");

    let mut client = MockTransport::connect(&server, "/q/here").expect("upgrade");
    client.send_text("sync");
    assert_eq!(client.expect_text().await, "ok");
    assert!(saw_null.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unparsable_path_parameter_routes_to_error_callback_and_stays_open() {
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);

    let server = Server::default();
    let endpoint = Endpoint::builder("/n/{num}", || ())
        .on_message(
            vec![
                Param::message(MessageShape::Text),
                Param::path_param("num", PathTarget::I64),
            ],
            |_, _| Ok(Reply::Text("reached".to_owned())),
        )
        .on_error(vec![Param::Cause], move |_, args| {
            if let Some(cause) = args.cause() {
                sink.lock().expect("error log").push(cause.to_string());
            }
            Ok(())
        })
        .build();
    server.register(endpoint).expect("endpoint registers");

    let mut client = MockTransport::connect(&server, "/n/not-a-number").expect("upgrade");
    client.send_text("go");
    client.expect_silence(100).await;

    let errors = errors.lock().expect("error log");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("decode failure"), "got: {}", errors[0]);
    drop(errors);

    // Connection is still alive: control traffic flows.
    client.send_ping(b"still-there");
    assert_eq!(client.expect_pong().await, b"still-there");
}
