//! End-to-End: decoder selection by predicate and declaration order.
//!
//! # Coverage
//! - Two text decoders for one type: the first whose predicate accepts
//!   runs; otherwise the next is consulted.
//! - No acceptor: decode failure reaches the error callback and the
//!   connection stays open.
//! - A decoder that throws is likewise a decode failure.
//! - Matched encoder/decoder pairs round-trip through the session.

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};

use ws_core::{
    Codec, CodecError, Decoder, Encoder, Endpoint, MessageShape, Param, Reply, Server,
    TextDecoder, TextEncoder,
};
use ws_test_utils::MockTransport;

#[derive(Debug, Clone, PartialEq)]
struct Command {
    tag: &'static str,
    body: String,
}

struct PrefixDecoder {
    prefix: &'static str,
    tag: &'static str,
}

impl Codec for PrefixDecoder {
    fn target(&self) -> TypeId {
        TypeId::of::<Command>()
    }
}

impl TextDecoder for PrefixDecoder {
    fn will_decode(&self, raw: &str) -> bool {
        raw.starts_with(self.prefix)
    }

    fn decode(&self, raw: &str) -> Result<Box<dyn Any + Send>, CodecError> {
        Ok(Box::new(Command {
            tag: self.tag,
            body: raw.to_owned(),
        }))
    }
}

struct FailingDecoder;

impl Codec for FailingDecoder {
    fn target(&self) -> TypeId {
        TypeId::of::<Command>()
    }
}

impl TextDecoder for FailingDecoder {
    fn will_decode(&self, _raw: &str) -> bool {
        true
    }

    fn decode(&self, _raw: &str) -> Result<Box<dyn Any + Send>, CodecError> {
        Err(CodecError::new("decoder exploded"))
    }
}

struct CommandEncoder;

impl Codec for CommandEncoder {
    fn target(&self) -> TypeId {
        TypeId::of::<Command>()
    }
}

impl TextEncoder for CommandEncoder {
    fn encode(&self, value: &(dyn Any + Send)) -> Result<String, CodecError> {
        let command = value
            .downcast_ref::<Command>()
            .ok_or_else(|| CodecError::new("wrong type"))?;
        Ok(format!("{}|{}", command.tag, command.body))
    }
}

fn selection_server(errors: Arc<Mutex<Vec<String>>>) -> Server {
    let server = Server::default();
    let endpoint = Endpoint::builder("/select", || ())
        .decoder(Decoder::Text(Arc::new(PrefixDecoder {
            prefix: "A:",
            tag: "first",
        })))
        .decoder(Decoder::Text(Arc::new(PrefixDecoder {
            prefix: "B:",
            tag: "second",
        })))
        .on_message(
            vec![Param::message(MessageShape::custom::<Command>())],
            |_, args| {
                let command = args.object_as::<Command>(0).expect("decoded command");
                Ok(Reply::Text(command.tag.to_owned()))
            },
        )
        .on_error(vec![Param::Cause], move |_, args| {
            if let Some(cause) = args.cause() {
                errors.lock().expect("error log").push(cause.to_string());
            }
            Ok(())
        })
        .build();
    server.register(endpoint).expect("endpoint registers");
    server
}

#[tokio::test]
async fn first_accepting_decoder_runs_in_declaration_order() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let server = selection_server(Arc::clone(&errors));
    let mut client = MockTransport::connect(&server, "/select").expect("upgrade");

    client.send_text("A:x");
    assert_eq!(client.expect_text().await, "first");

    client.send_text("B:y");
    assert_eq!(client.expect_text().await, "second");

    assert!(errors.lock().expect("error log").is_empty());
}

#[tokio::test]
async fn no_acceptor_is_a_decode_failure_and_the_connection_survives() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let server = selection_server(Arc::clone(&errors));
    let mut client = MockTransport::connect(&server, "/select").expect("upgrade");

    client.send_text("--");
    client.expect_silence(100).await;
    {
        let errors = errors.lock().expect("error log");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("decode failure"), "got: {}", errors[0]);
    }

    // Next messages proceed normally.
    client.send_text("A:after");
    assert_eq!(client.expect_text().await, "first");
}

#[tokio::test]
async fn throwing_decoder_is_a_decode_failure() {
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);

    let server = Server::default();
    let endpoint = Endpoint::builder("/boom", || ())
        .decoder(Decoder::Text(Arc::new(FailingDecoder)))
        .on_message(
            vec![Param::message(MessageShape::custom::<Command>())],
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

    let mut client = MockTransport::connect(&server, "/boom").expect("upgrade");
    client.send_text("anything");
    client.expect_silence(100).await;

    let errors = errors.lock().expect("error log");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("decoder exploded"), "got: {}", errors[0]);
}

struct JsonDecoder;

impl Codec for JsonDecoder {
    fn target(&self) -> TypeId {
        TypeId::of::<serde_json::Value>()
    }
}

impl TextDecoder for JsonDecoder {
    fn will_decode(&self, raw: &str) -> bool {
        raw.trim_start().starts_with(['{', '['])
    }

    fn decode(&self, raw: &str) -> Result<Box<dyn Any + Send>, CodecError> {
        serde_json::from_str::<serde_json::Value>(raw)
            .map(|v| Box::new(v) as Box<dyn Any + Send>)
            .map_err(CodecError::new)
    }
}

struct JsonEncoder;

impl Codec for JsonEncoder {
    fn target(&self) -> TypeId {
        TypeId::of::<serde_json::Value>()
    }
}

impl TextEncoder for JsonEncoder {
    fn encode(&self, value: &(dyn Any + Send)) -> Result<String, CodecError> {
        let json = value
            .downcast_ref::<serde_json::Value>()
            .ok_or_else(|| CodecError::new("wrong type"))?;
        serde_json::to_string(json).map_err(CodecError::new)
    }
}

#[tokio::test]
async fn json_codecs_round_trip_structured_payloads() {
    let server = Server::default();
    let endpoint = Endpoint::builder("/json", || ())
        .decoder(Decoder::Text(Arc::new(JsonDecoder)))
        .encoder(Encoder::Text(Arc::new(JsonEncoder)))
        .on_message(
            vec![Param::message(MessageShape::custom::<serde_json::Value>())],
            |_, args| {
                let mut json = args
                    .object_as::<serde_json::Value>(0)
                    .cloned()
                    .unwrap_or_default();
                if let Some(map) = json.as_object_mut() {
                    map.insert("seen".to_owned(), serde_json::Value::Bool(true));
                }
                Ok(Reply::object(json))
            },
        )
        .build();
    server.register(endpoint).expect("endpoint registers");

    let mut client = MockTransport::connect(&server, "/json").expect("upgrade");
    client.send_text(r#"{"kind":"probe"}"#);
    let reply: serde_json::Value =
        serde_json::from_str(&client.expect_text().await).expect("reply parses");
    assert_eq!(reply["kind"], "probe");
    assert_eq!(reply["seen"], true);
}

#[tokio::test]
async fn matched_codec_pair_round_trips_through_send_object() {
    let server = Server::default();
    let endpoint = Endpoint::builder("/pair", || ())
        .decoder(Decoder::Text(Arc::new(PrefixDecoder {
            prefix: "",
            tag: "seen",
        })))
        .encoder(Encoder::Text(Arc::new(CommandEncoder)))
        .on_message(
            vec![Param::message(MessageShape::custom::<Command>())],
            |_, args| {
                let command = args.object_as::<Command>(0).expect("decoded command");
                Ok(Reply::object(command.clone()))
            },
        )
        .build();
    server.register(endpoint).expect("endpoint registers");

    let mut client = MockTransport::connect(&server, "/pair").expect("upgrade");
    client.send_text("payload");
    assert_eq!(client.expect_text().await, "seen|payload");
}
