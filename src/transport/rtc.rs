//! Default peer transport over the `webrtc` crate
//!
//! Wraps `RTCPeerConnection` behind the [`PeerTransport`] seam. ICE, DTLS
//! and SCTP live entirely inside the webrtc stack; this module only adapts
//! its callback surface to the engine's watch/handle model.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, error};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::TransportError;
use crate::proto::{IceCandidate, IceServer, LegKind};
use crate::transport::capability::{
    DataChannelHandle, LegConnectionState, PeerTransport, PeerTransportFactory, SdpKind,
};

fn map_state(state: RTCPeerConnectionState) -> LegConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            LegConnectionState::New
        }
        RTCPeerConnectionState::Connecting => LegConnectionState::Connecting,
        RTCPeerConnectionState::Connected => LegConnectionState::Connected,
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
            LegConnectionState::Disconnected
        }
        RTCPeerConnectionState::Failed => LegConnectionState::Failed,
    }
}

/// `RTCPeerConnection` adapter for one leg
pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<LegConnectionState>,
}

impl RtcPeerTransport {
    pub async fn new(kind: LegKind, ice_servers: &[IceServer]) -> Result<Self, TransportError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| TransportError::Capability(format!("codec registration: {}", e)))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)
            .map_err(|e| TransportError::Capability(format!("interceptors: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Capability(format!("peer connection: {}", e)))?,
        );

        let (state_tx, state_rx) = watch::channel(LegConnectionState::New);
        let leg_name = kind.name();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!("{} leg rtc state: {}", leg_name, s);
            let _ = state_tx.send(map_state(s));
            Box::pin(async {})
        }));

        Ok(Self { pc, state_rx })
    }

    fn description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, TransportError> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        };
        desc.map_err(|e| TransportError::Negotiation(format!("invalid sdp: {}", e)))
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("create answer: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(Self::description(kind, sdp)?)
            .await
            .map_err(|e| TransportError::Negotiation(format!("set local description: {}", e)))
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(Self::description(kind, sdp)?)
            .await
            .map_err(|e| TransportError::Negotiation(format!("set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| TransportError::Ice(format!("add candidate: {}", e)))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        lossy: bool,
    ) -> Result<Arc<dyn DataChannelHandle>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(!lossy),
            max_retransmits: if lossy { Some(0) } else { None },
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| TransportError::DataChannel(format!("create channel: {}", e)))?;
        Ok(Arc::new(RtcDataChannel { dc }))
    }

    fn state_changes(&self) -> watch::Receiver<LegConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Capability(format!("close: {}", e)))
    }
}

struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelHandle for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::DataChannel(format!("send: {}", e)))
    }

    fn on_message(&self, handler: Box<dyn Fn(Bytes) + Send + Sync>) {
        let handler = Arc::new(handler);
        self.dc.on_message(Box::new(move |msg| {
            let handler = Arc::clone(&handler);
            let data = msg.data.clone();
            Box::pin(async move {
                handler(data);
            })
        }));
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc
            .close()
            .await
            .map_err(|e| TransportError::DataChannel(format!("close: {}", e)))
    }
}

/// Factory producing one [`RtcPeerTransport`] per leg
#[derive(Default)]
pub struct RtcTransportFactory;

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        kind: LegKind,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        match RtcPeerTransport::new(kind, ice_servers).await {
            Ok(transport) => Ok(Arc::new(transport)),
            Err(e) => {
                error!("failed to build {} leg transport: {}", kind.name(), e);
                Err(e)
            }
        }
    }
}
