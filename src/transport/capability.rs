//! Injected transport capability
//!
//! The engine does not implement NAT traversal or media encoding; it drives
//! an injected per-leg transport object through this seam. Production uses
//! [`crate::transport::rtc::RtcPeerTransport`]; tests drive the engine with
//! a scripted mock.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::error::TransportError;
use crate::proto::{IceCandidate, IceServer, LegKind};

/// Role of an SDP being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connection state of one transport leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl LegConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }
}

/// Handle to one data channel created on a transport
#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Install the message callback; replaces any previous handler
    fn on_message(&self, handler: Box<dyn Fn(Bytes) + Send + Sync>);

    async fn close(&self) -> Result<(), TransportError>;
}

/// One leg's transport capability: offer/answer, candidates, data
/// channels, and state-change notifications
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;

    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: String)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn create_data_channel(
        &self,
        label: &str,
        lossy: bool,
    ) -> Result<Arc<dyn DataChannelHandle>, TransportError>;

    /// Watch channel of leg connection-state changes
    fn state_changes(&self) -> watch::Receiver<LegConnectionState>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds one transport per leg; a full reconnect builds fresh ones
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        kind: LegKind,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
