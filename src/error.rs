//! Error types for the roomlink session engine

use thiserror::Error;

use crate::proto::ProtoError;

/// Result type alias for roomlink operations
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Initial-connection failures. Fatal: the engine never retries these
/// internally, they are surfaced straight to the caller.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Server answered the join with an error frame
    #[error("join rejected (code {code}): {message}")]
    JoinRejected { code: u32, message: String },

    /// The control channel could not be established
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// Server speaks an incompatible protocol version
    #[error("protocol version mismatch: server {server}, client {client}")]
    VersionMismatch { server: u32, client: u32 },

    /// No join confirmation within the configured timeout
    #[error("join timed out")]
    Timeout,

    /// Signaling failure during the handshake
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Control-channel failures
#[derive(Debug, Error)]
pub enum SignalError {
    /// Operation requires a live control channel
    #[error("signaling client is not connected")]
    NotConnected,

    /// The client was closed; queued requests were dropped
    #[error("signaling client closed")]
    Closed,

    /// Server rejected the resume handshake (stale or unknown token);
    /// the caller must fall back to a full reconnect
    #[error("resume rejected: {0}")]
    ResumeRejected(String),

    /// No response within the handshake timeout
    #[error("signaling request timed out")]
    Timeout,

    /// Wire codec failure
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Underlying stream failure
    #[error("control stream error: {0}")]
    Stream(String),
}

/// Transport-leg failures. Retried via the reconnect policy up to its
/// attempt budget, then fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Offer/answer exchange failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// ICE candidate handling failed
    #[error("ice error: {0}")]
    Ice(String),

    /// Data channel creation or send failed
    #[error("data channel error: {0}")]
    DataChannel(String),

    /// Injected transport capability returned an error
    #[error("transport capability error: {0}")]
    Capability(String),

    /// Leg has been closed
    #[error("transport leg closed")]
    Closed,
}

/// Publish failures. Local to the publish call, never affect session state.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Server rejected the publish request
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// No server acknowledgment within the publish timeout
    #[error("publish acknowledgment timed out")]
    AckTimeout,

    /// A pending publication already exists for this correlation id
    #[error("duplicate publication for cid {0}")]
    DuplicateCid(String),

    /// Session is not connected and the publish could not be queued
    #[error("session is not connected")]
    NotConnected,

    /// Signaling failure while sending the request
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// RPC failures. Local to the call, never escalate to session state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Remote participant has no handler registered for the method
    #[error("unsupported rpc method")]
    UnsupportedMethod,

    /// Target participant disconnected before responding
    #[error("rpc recipient disconnected")]
    RecipientDisconnected,

    /// Remote handler ran and raised an application error
    #[error("rpc application error: {0}")]
    ApplicationError(String),

    /// No response within the caller-specified deadline
    #[error("rpc timed out")]
    Timeout,

    /// The caller aborted the invocation
    #[error("rpc aborted")]
    Aborted,

    /// Session is not connected
    #[error("session is not connected")]
    NotConnected,

    /// Reliable data channel failure while sending the request
    #[error("rpc transport error: {0}")]
    Transport(String),
}

/// Umbrella error for the session engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Session reached terminal Disconnected; a new session is required
    #[error("session terminated: {reason}")]
    Terminal { reason: String },

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}
