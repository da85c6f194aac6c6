//! Signaling: control-channel streams and the protocol client

pub mod client;
pub mod stream;

pub use client::{SignalEvent, SignalState, SignalingClient, SignalingSession};
pub use stream::{memory_pair, ControlDial, ControlStream, MemoryControlStream, WsControlStream, WsDialer};
