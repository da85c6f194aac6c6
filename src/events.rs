//! Session event surface
//!
//! Every observable change is one variant of [`SessionEvent`], delivered in
//! order on an unbounded channel handed out by the session. Events carry
//! owned data so consumers never borrow session state.

use bytes::Bytes;

use crate::proto::{SpeakerInfo, StreamState, TrackInfo};

/// Events emitted by a session over its lifetime
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Initial connection established and the join handshake completed
    Connected,

    /// Connection lost; the reconnect coordinator is retrying
    Reconnecting,

    /// A resume or full reconnect succeeded
    Reconnected,

    /// Terminal disconnect; the session must be recreated to rejoin
    Disconnected { reason: String },

    /// A remote participant joined the room
    ParticipantJoined {
        sid: String,
        identity: String,
        name: String,
    },

    /// A remote participant left the room
    ParticipantLeft { sid: String },

    /// A remote track was announced
    TrackPublished {
        participant_sid: String,
        track: TrackInfo,
    },

    /// A previously announced track is gone
    TrackUnpublished {
        participant_sid: String,
        track_id: String,
    },

    /// Subscription to a remote track became active
    TrackSubscribed { track_id: String },

    /// Subscription to a remote track ended
    TrackUnsubscribed { track_id: String },

    /// A track was muted by its owner
    TrackMuted { track_id: String },

    /// A track was unmuted by its owner
    TrackUnmuted { track_id: String },

    /// Server push of the current active speakers
    ActiveSpeakersChanged { speakers: Vec<SpeakerInfo> },

    /// Server paused or resumed delivery of a subscribed track
    StreamStateChanged {
        track_id: String,
        state: StreamState,
    },

    /// Application payload received on a data channel
    DataReceived {
        participant_sid: Option<String>,
        payload: Bytes,
        lossy: bool,
    },
}

impl SessionEvent {
    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::Disconnected { .. } => "disconnected",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::TrackPublished { .. } => "track_published",
            Self::TrackUnpublished { .. } => "track_unpublished",
            Self::TrackSubscribed { .. } => "track_subscribed",
            Self::TrackUnsubscribed { .. } => "track_unsubscribed",
            Self::TrackMuted { .. } => "track_muted",
            Self::TrackUnmuted { .. } => "track_unmuted",
            Self::ActiveSpeakersChanged { .. } => "active_speakers_changed",
            Self::StreamStateChanged { .. } => "stream_state_changed",
            Self::DataReceived { .. } => "data_received",
        }
    }
}
