//! End-to-End: return-value auto-reply on a text endpoint.
//!
//! # Coverage
//! - Echo via return value: a text callback returning a string produces a
//!   single outbound text frame on the same session.
//! - Per-connection ordering: replies come back in arrival order.
//! - Callback ordering: open precedes messages, close follows them.
//! - Object returns route through the encoder fallback (primitives send as
//!   their display form).

use std::sync::{Arc, Mutex};

use ws_core::{Endpoint, MessageShape, Param, Reply, Server};
use ws_proto::CloseCode;
use ws_test_utils::MockTransport;

fn echo_server() -> Server {
    let server = Server::default();
    let endpoint = Endpoint::builder("/echo", || ())
        .on_message(vec![Param::message(MessageShape::Text)], |_, args| {
            Ok(Reply::Text(format!("{}!", args.text(0).unwrap_or(""))))
        })
        .build();
    server.register(endpoint).expect("echo endpoint registers");
    server
}

#[tokio::test]
async fn text_return_value_is_echoed_as_one_text_frame() {
    let server = echo_server();
    let mut client = MockTransport::connect(&server, "/echo").expect("upgrade");

    client.send_text("hi");
    assert_eq!(client.expect_text().await, "hi!");
}

#[tokio::test]
async fn replies_preserve_message_arrival_order() {
    let server = echo_server();
    let mut client = MockTransport::connect(&server, "/echo").expect("upgrade");

    for i in 0..10 {
        client.send_text(&format!("m{i}"));
    }
    for i in 0..10 {
        assert_eq!(client.expect_text().await, format!("m{i}!"));
    }
}

#[tokio::test]
async fn open_precedes_messages_and_close_follows_them() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let open_log = Arc::clone(&log);
    let message_log = Arc::clone(&log);
    let close_log = Arc::clone(&log);

    let server = Server::default();
    let endpoint = Endpoint::builder("/trace", || ())
        .on_open(vec![Param::Session], move |_, _| {
            open_log.lock().expect("log lock").push("open".to_owned());
            Ok(())
        })
        .on_message(
            vec![Param::message(MessageShape::Text)],
            move |_, args| {
                message_log
                    .lock()
                    .expect("log lock")
                    .push(format!("message:{}", args.text(0).unwrap_or("")));
                Ok(Reply::None)
            },
        )
        .on_close(vec![Param::CloseReason], move |_, _| {
            close_log.lock().expect("log lock").push("close".to_owned());
            Ok(())
        })
        .build();
    server.register(endpoint).expect("trace endpoint registers");

    let mut client = MockTransport::connect(&server, "/trace").expect("upgrade");
    client.send_text("a");
    client.send_text("b");
    client.send_close(CloseCode::Normal, "done");
    let (code, _) = client.expect_close().await;
    assert_eq!(code, CloseCode::Normal);

    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["open", "message:a", "message:b", "close"]
    );
}

#[tokio::test]
async fn object_returns_fall_back_to_display_text() {
    let server = Server::default();
    let endpoint = Endpoint::builder("/len", || ())
        .on_message(vec![Param::message(MessageShape::Text)], |_, args| {
            Ok(Reply::object(args.text(0).unwrap_or("").len() as u64))
        })
        .build();
    server.register(endpoint).expect("len endpoint registers");

    let mut client = MockTransport::connect(&server, "/len").expect("upgrade");
    client.send_text("four");
    assert_eq!(client.expect_text().await, "4");
}

#[tokio::test]
async fn reader_shaped_callbacks_see_the_buffered_whole_message() {
    let server = Server::default();
    let endpoint = Endpoint::builder("/lines", || ())
        .on_message(vec![Param::message(MessageShape::Reader)], |_, args| {
            let reader = args.reader(0).ok_or_else(|| {
                ws_core::HandlerError::new("reader argument missing")
            })?;
            let lines = std::io::BufRead::lines(reader).count();
            Ok(Reply::Text(lines.to_string()))
        })
        .build();
    server.register(endpoint).expect("lines endpoint registers");

    let mut client = MockTransport::connect(&server, "/lines").expect("upgrade");
    client.send_fragmented_text(&["one\ntw", "o\nthree"]);
    assert_eq!(client.expect_text().await, "3");
}

#[tokio::test]
async fn void_returns_send_nothing() {
    let server = Server::default();
    let endpoint = Endpoint::builder("/quiet", || ())
        .on_message(vec![Param::message(MessageShape::Text)], |_, _| {
            Ok(Reply::None)
        })
        .build();
    server.register(endpoint).expect("quiet endpoint registers");

    let mut client = MockTransport::connect(&server, "/quiet").expect("upgrade");
    client.send_text("anything");
    client.expect_silence(100).await;
}
