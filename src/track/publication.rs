//! Track publications
//!
//! Local publications are tracks this participant announced and the server
//! acknowledged; remote publications mirror what other participants have
//! announced, plus this client's subscription intent.

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::PublishError;
use crate::proto::{StreamState, TrackInfo, TrackKind};

/// Server-assigned track identifier
pub type TrackId = String;

/// A track the application wants to publish
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub name: String,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Generate a client-side correlation id for a publish request
pub fn new_cid() -> String {
    format!("TR_{}", Uuid::new_v4().simple())
}

/// A publish request awaiting the server's `TrackPublished` acknowledgment
#[derive(Debug)]
pub struct PendingPublication {
    pub cid: String,
    pub track: LocalTrack,
    pub reply: oneshot::Sender<Result<TrackId, PublishError>>,
}

/// A track this participant has published and the server acknowledged
#[derive(Debug, Clone)]
pub struct LocalPublication {
    pub info: TrackInfo,
    pub muted: bool,
}

impl LocalPublication {
    pub fn track_id(&self) -> &str {
        &self.info.track_id
    }

    pub fn cid(&self) -> &str {
        &self.info.cid
    }
}

/// A remote participant's track as seen by this client
#[derive(Debug, Clone)]
pub struct RemotePublication {
    pub info: TrackInfo,
    /// This client's subscription intent
    pub subscribed: bool,
    /// Server-reported delivery state, only meaningful while subscribed
    pub stream_state: StreamState,
    /// Server permission to subscribe; revocation forces `subscribed` off
    pub allowed: bool,
}

impl RemotePublication {
    pub fn new(info: TrackInfo) -> Self {
        Self {
            info,
            subscribed: false,
            stream_state: StreamState::Active,
            allowed: true,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.info.track_id
    }
}
