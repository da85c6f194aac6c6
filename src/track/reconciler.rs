//! Track reconciler
//!
//! Owns every publication record: pending publishes awaiting server
//! acknowledgment, acknowledged local publications, and remote
//! publications per participant. Roster pushes are reconciled by symmetric
//! difference so that replaying the same snapshot is a no-op; this is what
//! lets the session re-validate state after a resume or full reconnect
//! without double-reporting tracks.
//!
//! Owned exclusively by the session actor; no interior locking.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::events::SessionEvent;
use crate::proto::{
    DataChannelDescriptor, Envelope, ParticipantInfo, StreamState, SyncSnapshot, TrackInfo,
};
use crate::track::publication::{
    LocalPublication, PendingPublication, RemotePublication, TrackId,
};

/// Publication bookkeeping for one session
#[derive(Default)]
pub struct TrackReconciler {
    pending: HashMap<String, PendingPublication>,
    locals: HashMap<TrackId, LocalPublication>,
    remotes: HashMap<String, HashMap<TrackId, RemotePublication>>,
}

impl TrackReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending publish and produce the `AddTrack` request.
    /// Rejects a cid that is already pending or already acknowledged; the
    /// pending record is handed back so the caller can fail its waiter.
    pub fn begin_publish(
        &mut self,
        pending: PendingPublication,
    ) -> Result<Envelope, PendingPublication> {
        let cid_live = self.pending.contains_key(&pending.cid)
            || self.locals.values().any(|l| l.cid() == pending.cid);
        if cid_live {
            return Err(pending);
        }
        let request = Envelope::AddTrack(crate::proto::AddTrackRequest {
            cid: pending.cid.clone(),
            kind: pending.track.kind,
            name: pending.track.name.clone(),
        });
        self.pending.insert(pending.cid.clone(), pending);
        Ok(request)
    }

    /// Server acknowledged a publish. Promotes the pending record keyed by
    /// the cid, or refreshes an already-local record after a republish.
    /// Returns false when the cid is unknown.
    pub fn complete_publish(&mut self, info: TrackInfo) -> bool {
        if let Some(pending) = self.pending.remove(&info.cid) {
            info!(
                "track {} published as {} ({})",
                info.cid, info.track_id, pending.track.name
            );
            let track_id = info.track_id.clone();
            self.locals.insert(
                track_id.clone(),
                LocalPublication {
                    muted: info.muted,
                    info,
                },
            );
            let _ = pending.reply.send(Ok(track_id));
            return true;
        }
        // Republish after a full reconnect keeps the cid; the server may
        // assign a fresh track id.
        let old_id = self
            .locals
            .values()
            .find(|l| l.cid() == info.cid)
            .map(|l| l.track_id().to_string());
        if let Some(local) = old_id.as_deref().and_then(|id| self.locals.remove(id)) {
            debug!("republished {} as {}", local.track_id(), info.track_id);
            self.locals.insert(
                info.track_id.clone(),
                LocalPublication {
                    muted: local.muted,
                    info,
                },
            );
            return true;
        }
        warn!("publish ack for unknown cid {}", info.cid);
        false
    }

    /// Fail a pending publish, leaving no residual record
    pub fn fail_publish(&mut self, cid: &str, error: PublishError) {
        if let Some(pending) = self.pending.remove(cid) {
            let _ = pending.reply.send(Err(error));
        }
    }

    /// Drop a local publication; returns the unpublish request when the
    /// track was known.
    pub fn unpublish(&mut self, track_id: &str) -> Option<Envelope> {
        self.locals.remove(track_id).map(|_| Envelope::TrackUnpublished {
            track_id: track_id.to_string(),
        })
    }

    /// Reconcile one participant's announced track list against local
    /// records. Idempotent: reapplying the same list yields no events.
    pub fn apply_participant_tracks(
        &mut self,
        participant: &ParticipantInfo,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let records = self.remotes.entry(participant.sid.clone()).or_default();

        let announced: HashSet<&str> =
            participant.tracks.iter().map(|t| t.track_id.as_str()).collect();

        // Absent ids first: unsubscribe precedes unpublish
        let gone: Vec<TrackId> = records
            .keys()
            .filter(|id| !announced.contains(id.as_str()))
            .cloned()
            .collect();
        for track_id in gone {
            if let Some(record) = records.remove(&track_id) {
                if record.subscribed {
                    events.push(SessionEvent::TrackUnsubscribed {
                        track_id: track_id.clone(),
                    });
                }
                events.push(SessionEvent::TrackUnpublished {
                    participant_sid: participant.sid.clone(),
                    track_id,
                });
            }
        }

        for info in &participant.tracks {
            if !records.contains_key(&info.track_id) {
                records.insert(info.track_id.clone(), RemotePublication::new(info.clone()));
                events.push(SessionEvent::TrackPublished {
                    participant_sid: participant.sid.clone(),
                    track: info.clone(),
                });
            }
        }
        events
    }

    /// Server announced a single remote track outside a roster push.
    /// Idempotent like the roster path.
    pub fn add_remote_track(&mut self, info: TrackInfo) -> Option<SessionEvent> {
        let sid = info.participant_sid.clone();
        let records = self.remotes.entry(sid.clone()).or_default();
        if records.contains_key(&info.track_id) {
            return None;
        }
        records.insert(info.track_id.clone(), RemotePublication::new(info.clone()));
        Some(SessionEvent::TrackPublished {
            participant_sid: sid,
            track: info,
        })
    }

    /// Server retired a single remote track outside a roster push
    pub fn remove_remote_track(&mut self, track_id: &str) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for (sid, records) in self.remotes.iter_mut() {
            if let Some(record) = records.remove(track_id) {
                if record.subscribed {
                    events.push(SessionEvent::TrackUnsubscribed {
                        track_id: track_id.to_string(),
                    });
                }
                events.push(SessionEvent::TrackUnpublished {
                    participant_sid: sid.clone(),
                    track_id: track_id.to_string(),
                });
                break;
            }
        }
        events
    }

    /// A participant left: retire every one of their tracks
    pub fn remove_participant(&mut self, sid: &str) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if let Some(records) = self.remotes.remove(sid) {
            for (track_id, record) in records {
                if record.subscribed {
                    events.push(SessionEvent::TrackUnsubscribed {
                        track_id: track_id.clone(),
                    });
                }
                events.push(SessionEvent::TrackUnpublished {
                    participant_sid: sid.to_string(),
                    track_id,
                });
            }
        }
        events
    }

    /// Update subscription intent; returns the wire request plus the local
    /// event when the intent actually changed. Subscribing to a track the
    /// server disallowed is refused.
    pub fn set_subscribed(
        &mut self,
        track_id: &str,
        subscribe: bool,
    ) -> Option<(Envelope, SessionEvent)> {
        let record = self.remote_mut(track_id)?;
        if subscribe && !record.allowed {
            warn!("subscription to {} not permitted", track_id);
            return None;
        }
        if record.subscribed == subscribe {
            return None;
        }
        record.subscribed = subscribe;
        let request = Envelope::SubscriptionUpdate {
            track_ids: vec![track_id.to_string()],
            subscribe,
        };
        let event = if subscribe {
            SessionEvent::TrackSubscribed {
                track_id: track_id.to_string(),
            }
        } else {
            SessionEvent::TrackUnsubscribed {
                track_id: track_id.to_string(),
            }
        };
        Some((request, event))
    }

    /// Server changed subscribe permission; revocation forces the intent off
    pub fn set_permission(&mut self, track_id: &str, allowed: bool) -> Option<SessionEvent> {
        let record = self.remote_mut(track_id)?;
        record.allowed = allowed;
        if !allowed && record.subscribed {
            record.subscribed = false;
            return Some(SessionEvent::TrackUnsubscribed {
                track_id: track_id.to_string(),
            });
        }
        None
    }

    /// Server-reported mute state for a remote track
    pub fn set_muted(&mut self, track_id: &str, muted: bool) -> Option<SessionEvent> {
        let record = self.remote_mut(track_id)?;
        if record.info.muted == muted {
            return None;
        }
        record.info.muted = muted;
        Some(if muted {
            SessionEvent::TrackMuted {
                track_id: track_id.to_string(),
            }
        } else {
            SessionEvent::TrackUnmuted {
                track_id: track_id.to_string(),
            }
        })
    }

    /// Server-reported delivery state for a subscribed track
    pub fn set_stream_state(
        &mut self,
        track_id: &str,
        state: StreamState,
    ) -> Option<SessionEvent> {
        let record = self.remote_mut(track_id)?;
        if record.stream_state == state {
            return None;
        }
        record.stream_state = state;
        Some(SessionEvent::StreamStateChanged {
            track_id: track_id.to_string(),
            state,
        })
    }

    /// State the server needs to restore this session on resume
    pub fn snapshot(
        &self,
        answer_sdp: Option<String>,
        data_channels: Vec<DataChannelDescriptor>,
    ) -> SyncSnapshot {
        let mut subscribed: Vec<String> = self
            .remotes
            .values()
            .flat_map(|records| records.values())
            .filter(|r| r.subscribed)
            .map(|r| r.track_id().to_string())
            .collect();
        subscribed.sort();
        let mut cids: Vec<String> = self.locals.values().map(|l| l.cid().to_string()).collect();
        cids.sort();
        SyncSnapshot {
            answer_sdp,
            subscribed_track_ids: subscribed,
            published_cids: cids,
            data_channels,
        }
    }

    /// Requests to replay after a full reconnect: re-announce every local
    /// publication, then restate the subscription set.
    pub fn replay_requests(&self) -> Vec<Envelope> {
        let mut requests: Vec<Envelope> = Vec::new();
        let mut locals: Vec<&LocalPublication> = self.locals.values().collect();
        locals.sort_by(|a, b| a.cid().cmp(b.cid()));
        for local in locals {
            requests.push(Envelope::AddTrack(crate::proto::AddTrackRequest {
                cid: local.cid().to_string(),
                kind: local.info.kind,
                name: local.info.name.clone(),
            }));
        }
        let mut subscribed: Vec<String> = self
            .remotes
            .values()
            .flat_map(|records| records.values())
            .filter(|r| r.subscribed)
            .map(|r| r.track_id().to_string())
            .collect();
        if !subscribed.is_empty() {
            subscribed.sort();
            requests.push(Envelope::SubscriptionUpdate {
                track_ids: subscribed,
                subscribe: true,
            });
        }
        requests
    }

    /// Fail every pending publish, used on terminal disconnect
    pub fn fail_all_pending(&mut self, reason: &str) {
        for (_, pending) in self.pending.drain() {
            let _ = pending
                .reply
                .send(Err(PublishError::Rejected(reason.to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn local(&self, track_id: &str) -> Option<&LocalPublication> {
        self.locals.get(track_id)
    }

    pub fn remote(&self, track_id: &str) -> Option<&RemotePublication> {
        self.remotes
            .values()
            .find_map(|records| records.get(track_id))
    }

    fn remote_mut(&mut self, track_id: &str) -> Option<&mut RemotePublication> {
        self.remotes
            .values_mut()
            .find_map(|records| records.get_mut(track_id))
    }
}
