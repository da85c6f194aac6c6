//! Transport leg
//!
//! Wraps one injected [`PeerTransport`] with the two invariants the session
//! engine depends on: at most one offer/answer cycle in flight per leg
//! (extra triggers coalesce into a single follow-up negotiation), and
//! remote candidates received before the remote description are buffered
//! and applied in arrival order once it is set.
//!
//! All mutation is driven from the session actor's serialized event stream,
//! so the flag/queue pair only needs a plain lock, never an async one.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::proto::{IceCandidate, LegKind};
use crate::transport::capability::{LegConnectionState, PeerTransport, SdpKind};

#[derive(Default)]
struct LegInner {
    /// An offer/answer cycle is in flight
    negotiating: bool,
    /// A trigger arrived during the in-flight cycle; run exactly one more
    renegotiate_pending: bool,
    /// Remote description has been applied; candidates bypass the buffer
    remote_set: bool,
    /// Candidates received before the remote description, in arrival order
    buffered_candidates: VecDeque<IceCandidate>,
}

/// One of the two independent transport legs
pub struct TransportLeg {
    kind: LegKind,
    peer: Arc<dyn PeerTransport>,
    inner: parking_lot::Mutex<LegInner>,
}

impl TransportLeg {
    pub fn new(kind: LegKind, peer: Arc<dyn PeerTransport>) -> Self {
        Self {
            kind,
            peer,
            inner: parking_lot::Mutex::new(LegInner::default()),
        }
    }

    pub fn kind(&self) -> LegKind {
        self.kind
    }

    pub fn peer(&self) -> &Arc<dyn PeerTransport> {
        &self.peer
    }

    pub fn state_changes(&self) -> watch::Receiver<LegConnectionState> {
        self.peer.state_changes()
    }

    /// Try to start an offer/answer cycle. Returns false when one is
    /// already in flight; the trigger is then coalesced and replayed by
    /// [`Self::finish_negotiation`].
    pub fn try_begin_negotiation(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.negotiating {
            debug!("{} leg: negotiation in flight, coalescing trigger", self.kind.name());
            inner.renegotiate_pending = true;
            false
        } else {
            inner.negotiating = true;
            true
        }
    }

    /// End the in-flight cycle; returns true when a coalesced trigger
    /// requires exactly one follow-up negotiation.
    pub fn finish_negotiation(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.negotiating = false;
        std::mem::take(&mut inner.renegotiate_pending)
    }

    /// Create and apply a local offer. Caller must hold the negotiation
    /// slot via [`Self::try_begin_negotiation`].
    pub async fn create_offer(&self) -> Result<String, TransportError> {
        let sdp = self.peer.create_offer().await?;
        self.peer
            .set_local_description(SdpKind::Offer, sdp.clone())
            .await?;
        Ok(sdp)
    }

    /// Apply the remote answer, drain buffered candidates, and close the
    /// negotiation cycle. Returns true when a coalesced trigger is pending.
    pub async fn apply_remote_answer(&self, sdp: String) -> Result<bool, TransportError> {
        self.peer
            .set_remote_description(SdpKind::Answer, sdp)
            .await?;
        self.drain_buffered_candidates().await?;
        Ok(self.finish_negotiation())
    }

    /// Apply a remote offer and produce the local answer (subscribe leg:
    /// the server is the offerer).
    pub async fn apply_remote_offer(&self, sdp: String) -> Result<String, TransportError> {
        self.peer.set_remote_description(SdpKind::Offer, sdp).await?;
        self.drain_buffered_candidates().await?;
        let answer = self.peer.create_answer().await?;
        self.peer
            .set_local_description(SdpKind::Answer, answer.clone())
            .await?;
        Ok(answer)
    }

    /// Apply a remote candidate, or buffer it when no remote description
    /// has been applied yet.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let pass = {
            let mut inner = self.inner.lock();
            if inner.remote_set {
                true
            } else {
                trace!("{} leg: buffering candidate before remote description", self.kind.name());
                inner.buffered_candidates.push_back(candidate.clone());
                false
            }
        };
        if pass {
            self.peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Number of candidates waiting for the remote description
    pub fn buffered_candidate_count(&self) -> usize {
        self.inner.lock().buffered_candidates.len()
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.peer.close().await
    }

    async fn drain_buffered_candidates(&self) -> Result<(), TransportError> {
        let drained: Vec<IceCandidate> = {
            let mut inner = self.inner.lock();
            inner.remote_set = true;
            inner.buffered_candidates.drain(..).collect()
        };
        if !drained.is_empty() {
            debug!(
                "{} leg: applying {} buffered candidates",
                self.kind.name(),
                drained.len()
            );
        }
        for candidate in drained {
            self.peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}
