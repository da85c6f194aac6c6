//! Transport engine
//!
//! Owns the two transport legs and their data channels, forwards leg state
//! changes and inbound data packets to the session actor, and tracks leg
//! failures independently: the session escalates only when the reconnect
//! budget runs out, and `both_failed` lets subscriber-primary deployments
//! observe partial failure without escalation.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::proto::{
    decode_packet, encode_packet, DataChannelDescriptor, DataPacket, IceCandidate, IceServer,
    LegKind,
};
use crate::transport::capability::{LegConnectionState, PeerTransportFactory};
use crate::transport::data_channel::{DataChannel, LOSSY_LABEL, RELIABLE_LABEL};
use crate::transport::leg::TransportLeg;

/// Events fed back into the session actor's serialized stream
#[derive(Debug)]
pub enum EngineEvent {
    /// A leg's connection state changed
    LegState {
        leg: LegKind,
        state: LegConnectionState,
    },
    /// A leg entered the failed state
    LegFailed { leg: LegKind },
    /// A packet arrived on one of the data channels
    PacketReceived { packet: DataPacket, lossy: bool },
}

#[derive(Default)]
struct FailureFlags {
    publish: bool,
    subscribe: bool,
}

/// Owns both transport legs and the publish-leg data channels
pub struct TransportEngine {
    factory: Arc<dyn PeerTransportFactory>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    publish: parking_lot::RwLock<Option<Arc<TransportLeg>>>,
    subscribe: parking_lot::RwLock<Option<Arc<TransportLeg>>>,
    reliable: parking_lot::RwLock<Option<Arc<DataChannel>>>,
    lossy: parking_lot::RwLock<Option<Arc<DataChannel>>>,
    failed: Arc<parking_lot::Mutex<FailureFlags>>,
    watch_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TransportEngine {
    /// Create the engine and the event receiver the session selects on
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                factory,
                event_tx,
                publish: parking_lot::RwLock::new(None),
                subscribe: parking_lot::RwLock::new(None),
                reliable: parking_lot::RwLock::new(None),
                lossy: parking_lot::RwLock::new(None),
                failed: Arc::new(parking_lot::Mutex::new(FailureFlags::default())),
                watch_tasks: parking_lot::Mutex::new(Vec::new()),
            },
            event_rx,
        )
    }

    /// Build (or rebuild, on a full reconnect) both legs and the publish
    /// data channels. Any existing legs are torn down first.
    pub async fn build(&self, ice_servers: &[IceServer]) -> Result<(), TransportError> {
        self.teardown().await;

        info!("building transport legs ({} ice servers)", ice_servers.len());
        let publish = Arc::new(TransportLeg::new(
            LegKind::Publish,
            self.factory.create(LegKind::Publish, ice_servers).await?,
        ));
        let subscribe = Arc::new(TransportLeg::new(
            LegKind::Subscribe,
            self.factory.create(LegKind::Subscribe, ice_servers).await?,
        ));

        self.spawn_state_watcher(&publish);
        self.spawn_state_watcher(&subscribe);

        // Both logical channels ride the publish leg for the leg's lifetime
        let reliable = Arc::new(DataChannel::new(
            RELIABLE_LABEL,
            false,
            publish.peer().create_data_channel(RELIABLE_LABEL, false).await?,
        ));
        let lossy = Arc::new(DataChannel::new(
            LOSSY_LABEL,
            true,
            publish.peer().create_data_channel(LOSSY_LABEL, true).await?,
        ));
        self.attach_packet_handler(&reliable);
        self.attach_packet_handler(&lossy);

        *self.publish.write() = Some(publish);
        *self.subscribe.write() = Some(subscribe);
        *self.reliable.write() = Some(reliable);
        *self.lossy.write() = Some(lossy);
        *self.failed.lock() = FailureFlags::default();
        Ok(())
    }

    fn leg(&self, kind: LegKind) -> Result<Arc<TransportLeg>, TransportError> {
        let slot = match kind {
            LegKind::Publish => &self.publish,
            LegKind::Subscribe => &self.subscribe,
        };
        slot.read().clone().ok_or(TransportError::Closed)
    }

    /// Start a publish-leg negotiation. Returns the offer SDP, or `None`
    /// when a cycle is already in flight and the trigger was coalesced.
    pub async fn negotiate_publish(&self) -> Result<Option<String>, TransportError> {
        let leg = self.leg(LegKind::Publish)?;
        if !leg.try_begin_negotiation() {
            return Ok(None);
        }
        match leg.create_offer().await {
            Ok(sdp) => Ok(Some(sdp)),
            Err(e) => {
                // Free the slot so the coalesced trigger (if any) can run
                leg.finish_negotiation();
                Err(e)
            }
        }
    }

    /// Apply the server's answer on a leg. Returns true when a coalesced
    /// trigger requires one follow-up negotiation.
    pub async fn handle_answer(&self, kind: LegKind, sdp: String) -> Result<bool, TransportError> {
        self.leg(kind)?.apply_remote_answer(sdp).await
    }

    /// Apply a server offer on the subscribe leg and produce the answer
    pub async fn handle_offer(&self, sdp: String) -> Result<String, TransportError> {
        self.leg(LegKind::Subscribe)?.apply_remote_offer(sdp).await
    }

    /// Apply or buffer a trickled remote candidate
    pub async fn add_candidate(
        &self,
        kind: LegKind,
        candidate: IceCandidate,
    ) -> Result<(), TransportError> {
        self.leg(kind)?.add_remote_candidate(candidate).await
    }

    /// Send one packet over the reliable or lossy channel
    pub async fn send_packet(&self, packet: &DataPacket, lossy: bool) -> Result<(), TransportError> {
        let frame = encode_packet(packet)
            .map_err(|e| TransportError::DataChannel(e.to_string()))?;
        let slot = if lossy { &self.lossy } else { &self.reliable };
        let channel = slot.read().clone().ok_or(TransportError::Closed)?;
        channel.send(frame).await
    }

    /// Descriptors of the open data channels, captured into the resume
    /// snapshot so the server preserves channel identity
    pub fn data_channel_descriptors(&self) -> Vec<DataChannelDescriptor> {
        [&self.reliable, &self.lossy]
            .iter()
            .filter_map(|slot| slot.read().as_ref().map(|dc| dc.descriptor()))
            .collect()
    }

    /// True once both legs sit in the failed state
    pub fn both_failed(&self) -> bool {
        let flags = self.failed.lock();
        flags.publish && flags.subscribe
    }

    /// Force a leg into the failed path (simulate-scenario debug hook)
    pub fn simulate_leg_failure(&self, kind: LegKind) {
        warn!("simulating {} leg failure", kind.name());
        self.mark_failed(kind, true);
        let _ = self.event_tx.send(EngineEvent::LegFailed { leg: kind });
    }

    /// Close legs and channels; used for teardown and full reconnects
    pub async fn teardown(&self) {
        for task in self.watch_tasks.lock().drain(..) {
            task.abort();
        }
        for slot in [&self.reliable, &self.lossy] {
            let dc = slot.write().take();
            if let Some(dc) = dc {
                if let Err(e) = dc.close().await {
                    debug!("data channel close: {}", e);
                }
            }
        }
        for slot in [&self.publish, &self.subscribe] {
            let leg = slot.write().take();
            if let Some(leg) = leg {
                if let Err(e) = leg.close().await {
                    debug!("{} leg close: {}", leg.kind().name(), e);
                }
            }
        }
    }

    fn mark_failed(&self, kind: LegKind, failed: bool) {
        let mut flags = self.failed.lock();
        match kind {
            LegKind::Publish => flags.publish = failed,
            LegKind::Subscribe => flags.subscribe = failed,
        }
    }

    fn spawn_state_watcher(&self, leg: &Arc<TransportLeg>) {
        let mut rx = leg.state_changes();
        let kind = leg.kind();
        let event_tx = self.event_tx.clone();
        let failed = Arc::clone(&self.failed);
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow();
                debug!("{} leg state: {}", kind.name(), state.name());
                {
                    let mut flags = failed.lock();
                    match (kind, state) {
                        (LegKind::Publish, LegConnectionState::Failed) => flags.publish = true,
                        (LegKind::Publish, LegConnectionState::Connected) => flags.publish = false,
                        (LegKind::Subscribe, LegConnectionState::Failed) => flags.subscribe = true,
                        (LegKind::Subscribe, LegConnectionState::Connected) => {
                            flags.subscribe = false
                        }
                        _ => {}
                    }
                }
                let _ = event_tx.send(EngineEvent::LegState { leg: kind, state });
                if state == LegConnectionState::Failed {
                    let _ = event_tx.send(EngineEvent::LegFailed { leg: kind });
                }
            }
        });
        self.watch_tasks.lock().push(task);
    }

    fn attach_packet_handler(&self, channel: &Arc<DataChannel>) {
        let event_tx = self.event_tx.clone();
        let lossy = channel.is_lossy();
        channel.on_message(Box::new(move |data: Bytes| {
            match decode_packet(&data) {
                Ok(packet) => {
                    let _ = event_tx.send(EngineEvent::PacketReceived { packet, lossy });
                }
                Err(e) => warn!("dropping undecodable data packet: {}", e),
            }
        }));
    }
}
