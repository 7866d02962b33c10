//! Bidirectional RPC and byte-stream channel multiplexing over any reliable
//! transport (Unix domain socket, TCP, TLS, WebSocket).
//!
//! A single [`upgrade`]d [`Connection`] carries two independent services on
//! one underlying stream: typed RPC (`register`/`call`) and in-order
//! byte-stream subchannels (`open_listener`/`join`). See the crate's design
//! notes for the wire protocol and concurrency model.
#![forbid(unsafe_code)]

mod ack_gate;
mod channel;
mod codec;
mod connection;
mod dispatcher;
mod error;
mod framer;
mod rpc;
pub mod transport;

pub use codec::{CapsuleValue, RpcDataCapsule, TypeDesc};
pub use connection::{upgrade, Channel, ChannelListener, Connection, Request};
pub use error::{Error, Result};
pub use rpc::{Handler, HandlerOutcome};
