//! Signaling wire protocol
//!
//! A single ordered control channel carries length-prefixed binary envelopes.
//! Each envelope is a tagged union of request/response/push variants encoded
//! with bincode behind a 4-byte big-endian length prefix. The layout must be
//! preserved byte-for-byte for interop with unmodified servers, so every
//! variant and field order here is part of the wire contract.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded envelope body size. Larger frames are rejected on both
/// the encode and decode side.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors produced by the envelope codec
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Not enough bytes for the length prefix or the announced body
    #[error("truncated frame")]
    Truncated,

    /// Frame body exceeds [`MAX_FRAME_SIZE`]
    #[error("frame of {0} bytes exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Serialization or deserialization failure (includes unknown tags)
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Which transport leg a negotiation or candidate message targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegKind {
    /// Client-to-server media leg, carries the data channels
    Publish,
    /// Server-to-client media leg
    Subscribe,
}

impl LegKind {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
        }
    }
}

/// Media kind of a published track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Server-reported delivery state of a subscribed track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Active,
    Paused,
}

/// ICE server entry handed out in the join response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Client identity and capabilities sent in the join handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub sdk: String,
    pub version: String,
    pub os: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            sdk: "roomlink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// A remote ICE candidate with its SDP attachment point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Offer or answer SDP for one leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub leg: LegKind,
    pub sdp: String,
}

/// Trickled ICE candidate for one leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrickleCandidate {
    pub leg: LegKind,
    pub candidate: IceCandidate,
}

/// Server-confirmed track identity and state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Server-assigned track id, unique and never reused
    pub track_id: String,
    /// Client-generated correlation id from the publish request
    pub cid: String,
    pub kind: TrackKind,
    pub name: String,
    pub muted: bool,
    /// Owning participant sid
    pub participant_sid: String,
}

/// Roster entry for one participant and its announced tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
    pub name: String,
    /// Authoritative list of this participant's published tracks
    pub tracks: Vec<TrackInfo>,
    /// False once the participant has left; the entry is then a tombstone
    pub active: bool,
}

/// Join request sent as the first frame on a fresh connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub token: String,
    pub protocol_version: u32,
    pub auto_subscribe: bool,
    pub client: ClientInfo,
}

/// Join confirmation carrying the per-connection session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub protocol_version: u32,
    /// The local participant as the server sees it
    pub participant: ParticipantInfo,
    /// Remote participants present at join time
    pub others: Vec<ParticipantInfo>,
    /// Opaque token required for a resume reconnect
    pub reconnect_token: String,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub ice_servers: Vec<IceServer>,
    /// True when the subscribe leg carries the primary connection
    pub subscriber_primary: bool,
    /// Region / alternate-URL hint for later reconnects
    pub alternate_url: Option<String>,
}

/// Descriptor for a data channel preserved across a resume reconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelDescriptor {
    pub label: String,
    pub lossy: bool,
}

/// Point-in-time session capture sent with a resume handshake so the server
/// can re-derive state without the client re-issuing historical requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Last answer the client applied on the subscribe leg
    pub answer_sdp: Option<String>,
    /// Active subscription set at snapshot time
    pub subscribed_track_ids: Vec<String>,
    /// Correlation ids of acknowledged local publications
    pub published_cids: Vec<String>,
    /// Open data channels on the publish leg
    pub data_channels: Vec<DataChannelDescriptor>,
}

/// Resume request reusing a server-issued reconnect token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub reconnect_token: String,
    pub snapshot: SyncSnapshot,
}

/// Resume confirmation; supersedes the previous reconnect token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeResponse {
    pub reconnect_token: String,
    /// Fresh roster baseline; reconciled exactly like a join-time roster
    pub participants: Vec<ParticipantInfo>,
}

/// Publish request correlating a local track intent by cid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTrackRequest {
    pub cid: String,
    pub kind: TrackKind,
    pub name: String,
}

/// Per-track stream-state push entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStateInfo {
    pub track_id: String,
    pub state: StreamState,
}

/// Active-speaker push entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerInfo {
    pub participant_sid: String,
    pub level: f32,
}

/// Debug hook carried on the production channel; servers are free to
/// ignore it. Used by chaos tests to force failure paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulateScenario {
    /// Force one transport leg into the failed state
    NodeFailure { leg: LegKind },
    /// Ask the server to send a Leave frame
    ServerLeave,
    /// Ask the server to emit synthetic speaker updates for N seconds
    SpeakerUpdate { seconds: u32 },
}

/// The signaling envelope: every frame on the control channel is exactly
/// one of these variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    Join(JoinRequest),
    JoinAck(JoinResponse),
    Resume(ResumeRequest),
    ResumeAck(ResumeResponse),
    Offer(SessionDescription),
    Answer(SessionDescription),
    Trickle(TrickleCandidate),
    AddTrack(AddTrackRequest),
    TrackPublished(TrackInfo),
    TrackUnpublished { track_id: String },
    Mute { track_id: String, muted: bool },
    ParticipantUpdate(Vec<ParticipantInfo>),
    SubscriptionUpdate { track_ids: Vec<String>, subscribe: bool },
    SubscriptionPermission { track_id: String, allowed: bool },
    StreamStateUpdate(Vec<StreamStateInfo>),
    SpeakerUpdate(Vec<SpeakerInfo>),
    Leave { can_reconnect: bool, reason: String },
    Ping { timestamp_ms: u64 },
    Pong { timestamp_ms: u64 },
    SimulateScenario(SimulateScenario),
    Error { code: u32, message: String },
}

impl Envelope {
    /// Frame name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::JoinAck(_) => "join_ack",
            Self::Resume(_) => "resume",
            Self::ResumeAck(_) => "resume_ack",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Trickle(_) => "trickle",
            Self::AddTrack(_) => "add_track",
            Self::TrackPublished(_) => "track_published",
            Self::TrackUnpublished { .. } => "track_unpublished",
            Self::Mute { .. } => "mute",
            Self::ParticipantUpdate(_) => "participant_update",
            Self::SubscriptionUpdate { .. } => "subscription_update",
            Self::SubscriptionPermission { .. } => "subscription_permission",
            Self::StreamStateUpdate(_) => "stream_state_update",
            Self::SpeakerUpdate(_) => "speaker_update",
            Self::Leave { .. } => "leave",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::SimulateScenario(_) => "simulate_scenario",
            Self::Error { .. } => "error",
        }
    }
}

/// Payload carried over the publish-leg data channels. User payloads and
/// RPC frames share the reliable channel, so every packet is tagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataPacket {
    /// Application payload (chat, byte streams)
    User {
        /// Sender sid, filled in by the server on delivery
        participant_sid: Option<String>,
        payload: Vec<u8>,
    },
    /// RPC frame, see [`crate::rpc`]
    Rpc(crate::rpc::RpcFrame),
}

/// Encode one envelope as a length-prefixed frame
pub fn encode_envelope(env: &Envelope) -> Result<Bytes, ProtoError> {
    let body = bincode::serialize(env)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode one envelope from the front of `buf`, returning the envelope and
/// the number of bytes consumed
pub fn decode_envelope(buf: &[u8]) -> Result<(Envelope, usize), ProtoError> {
    if buf.len() < 4 {
        return Err(ProtoError::Truncated);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(len));
    }
    if buf.len() < 4 + len {
        return Err(ProtoError::Truncated);
    }
    let env = bincode::deserialize(&buf[4..4 + len])?;
    Ok((env, 4 + len))
}

/// Encode a data-channel packet (no length prefix; SCTP preserves message
/// boundaries)
pub fn encode_packet(packet: &DataPacket) -> Result<Bytes, ProtoError> {
    let body = bincode::serialize(packet)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(body.len()));
    }
    Ok(Bytes::from(body))
}

/// Decode a data-channel packet
pub fn decode_packet(buf: &[u8]) -> Result<DataPacket, ProtoError> {
    Ok(bincode::deserialize(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_join() -> Envelope {
        Envelope::Join(JoinRequest {
            token: "tok".into(),
            protocol_version: 1,
            auto_subscribe: true,
            client: ClientInfo::default(),
        })
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = sample_join();
        let bytes = encode_envelope(&env).unwrap();
        let (decoded, consumed) = decode_envelope(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.name(), "join");
    }

    #[test]
    fn test_truncated_prefix() {
        let err = decode_envelope(&[0, 0]).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated));
    }

    #[test]
    fn test_truncated_body() {
        let bytes = encode_envelope(&sample_join()).unwrap();
        let err = decode_envelope(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        let err = decode_envelope(&buf).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge(_)));
    }

    #[test]
    fn test_consumed_excludes_trailing_bytes() {
        let mut bytes = encode_envelope(&Envelope::Ping { timestamp_ms: 7 })
            .unwrap()
            .to_vec();
        let frame_len = bytes.len();
        bytes.extend_from_slice(&[0xAA; 8]);
        let (env, consumed) = decode_envelope(&bytes).unwrap();
        assert_eq!(consumed, frame_len);
        assert!(matches!(env, Envelope::Ping { timestamp_ms: 7 }));
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = DataPacket::User {
            participant_sid: Some("PA_1".into()),
            payload: vec![1, 2, 3],
        };
        let bytes = encode_packet(&packet).unwrap();
        match decode_packet(&bytes).unwrap() {
            DataPacket::User { payload, .. } => assert_eq!(payload, vec![1, 2, 3]),
            _ => panic!("expected user packet"),
        }
    }
}
