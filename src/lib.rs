//! rusty-ws: a WebSocket endpoint dispatch engine.
//!
//! Convenience facade over the workspace crates: the engine itself lives in
//! `ws-core`, the frame vocabulary in `ws-proto`.

pub use ws_core::*;

pub use ws_proto as proto;
