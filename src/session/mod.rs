//! Session root
//!
//! One tokio task owns every piece of mutable session state and serializes
//! caller commands, signaling frames, transport events, and reconnect
//! timers through a single biased select loop. Callers talk to the actor
//! over an unbounded command channel and observe it through the event
//! channel handed out by [`Session::connect`].
//!
//! Reconnects are coordinated here: a control-channel failure first
//! attempts a resume (reconnect token plus state snapshot); a rejected
//! resume or a transport-leg loss falls back to a full reconnect that
//! rebuilds both legs, re-joins, and replays publications and
//! subscriptions. Every attempt consumes one unit of the reconnect
//! policy's budget; an exhausted budget is terminal.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{SessionConfig, PROTOCOL_VERSION};
use crate::error::{ConnectError, PublishError, RpcError, SignalError};
use crate::events::SessionEvent;
use crate::proto::{
    DataPacket, Envelope, IceServer, LegKind, ParticipantInfo, SessionDescription,
    SimulateScenario,
};
use crate::reconnect::ReconnectContext;
use crate::rpc::{RpcHandler, RpcRegistry};
use crate::signaling::client::{SignalEvent, SignalingClient, SignalingSession};
use crate::track::publication::{new_cid, LocalTrack, PendingPublication, TrackId};
use crate::track::reconciler::TrackReconciler;
use crate::transport::engine::{EngineEvent, TransportEngine};

/// Observable session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    /// Retrying; `full` is false while a resume is still viable
    Reconnecting { full: bool },
    /// Terminal; a new session is required to rejoin
    Disconnected,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { full: false } => "reconnecting_resume",
            Self::Reconnecting { full: true } => "reconnecting_full",
            Self::Disconnected => "disconnected",
        }
    }
}

enum Command {
    Publish {
        track: LocalTrack,
        reply: oneshot::Sender<Result<TrackId, PublishError>>,
    },
    Unpublish {
        track_id: String,
    },
    SetSubscribed {
        track_id: String,
        subscribe: bool,
    },
    SendData {
        payload: Bytes,
        lossy: bool,
    },
    PerformRpc {
        target: String,
        method: String,
        payload: Bytes,
        timeout: Duration,
        reply: oneshot::Sender<Result<Bytes, RpcError>>,
    },
    RegisterRpcHandler {
        method: String,
        handler: RpcHandler,
    },
    Simulate(SimulateScenario),
    Disconnect,
    // Internal deadline ticks posted by spawned timers
    PublishTimeout { cid: String },
    RpcTimeout { id: String },
}

/// Handle to a connected session. Cloneable; dropping every handle leaves
/// the actor running until disconnect or terminal failure.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: tokio::sync::watch::Receiver<SessionState>,
    local_sid: String,
}

impl Session {
    /// Connect, join, and build the transport legs. Returns the session
    /// handle and the ordered event stream.
    pub async fn connect(
        url: &str,
        token: &str,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ConnectError> {
        let (signal, signal_rx) = SignalingClient::new(Arc::clone(&config.dialer));
        let (signal_session, join) = signal
            .connect(
                url,
                token,
                config.client.clone(),
                PROTOCOL_VERSION,
                config.auto_subscribe,
                config.join_timeout,
            )
            .await?;

        let (engine, engine_rx) = TransportEngine::new(Arc::clone(&config.transport_factory));
        let ice = merge_ice_servers(&config.ice_servers, &signal_session.ice_servers);
        engine
            .build(&ice)
            .await
            .map_err(|e| ConnectError::Unreachable(format!("transport setup: {}", e)))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = tokio::sync::watch::channel(SessionState::Connected);

        let local_sid = join.participant.sid.clone();
        let mut actor = SessionActor {
            url: url.to_string(),
            token: token.to_string(),
            config,
            signal,
            engine,
            signal_rx,
            engine_rx,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            event_tx,
            state_tx,
            signal_session,
            local_sid: local_sid.clone(),
            participants: Vec::new(),
            reconciler: TrackReconciler::new(),
            rpc: RpcRegistry::new(),
            last_answer_sdp: None,
            reconnect: None,
            queued: VecDeque::new(),
        };

        actor.emit(SessionEvent::Connected);
        let others = join.others.clone();
        actor.apply_roster(&others);
        // Open the publish leg immediately so the data channels come up
        actor.start_publish_negotiation().await;

        tokio::spawn(async move { actor.run().await });

        Ok((
            Self {
                cmd_tx,
                state_rx,
                local_sid,
            },
            event_rx,
        ))
    }

    /// Server-assigned sid of the local participant
    pub fn local_sid(&self) -> &str {
        &self.local_sid
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Publish a local track; resolves once the server acknowledges it
    pub async fn publish(&self, track: LocalTrack) -> Result<TrackId, PublishError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { track, reply })
            .map_err(|_| PublishError::NotConnected)?;
        rx.await.map_err(|_| PublishError::NotConnected)?
    }

    pub fn unpublish(&self, track_id: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Unpublish {
            track_id: track_id.into(),
        });
    }

    pub fn set_subscribed(&self, track_id: impl Into<String>, subscribe: bool) {
        let _ = self.cmd_tx.send(Command::SetSubscribed {
            track_id: track_id.into(),
            subscribe,
        });
    }

    /// Send an application payload over the reliable or lossy channel
    pub fn send_data(&self, payload: Bytes, lossy: bool) {
        let _ = self.cmd_tx.send(Command::SendData { payload, lossy });
    }

    /// Invoke a method on a remote participant over the reliable channel
    pub async fn perform_rpc(
        &self,
        target: impl Into<String>,
        method: impl Into<String>,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PerformRpc {
                target: target.into(),
                method: method.into(),
                payload,
                timeout,
                reply,
            })
            .map_err(|_| RpcError::NotConnected)?;
        rx.await.map_err(|_| RpcError::Aborted)?
    }

    /// Register the local handler for an inbound RPC method
    pub fn register_rpc_handler(&self, method: impl Into<String>, handler: RpcHandler) {
        let _ = self.cmd_tx.send(Command::RegisterRpcHandler {
            method: method.into(),
            handler,
        });
    }

    /// Debug hook forcing failure paths
    pub fn simulate_scenario(&self, scenario: SimulateScenario) {
        let _ = self.cmd_tx.send(Command::Simulate(scenario));
    }

    /// Leave the room and tear the session down
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectMode {
    Resume,
    Full,
}

struct PendingReconnect {
    mode: ReconnectMode,
    attempt: u32,
    started: Instant,
    at: Instant,
    reason: String,
}

struct SessionActor {
    url: String,
    token: String,
    config: SessionConfig,
    signal: SignalingClient,
    engine: TransportEngine,
    signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    state_tx: tokio::sync::watch::Sender<SessionState>,
    signal_session: SignalingSession,
    local_sid: String,
    /// Known remote participant sids, for join/left diffing
    participants: Vec<String>,
    reconciler: TrackReconciler,
    rpc: RpcRegistry,
    /// Last answer applied on the subscribe leg, captured into snapshots
    last_answer_sdp: Option<String>,
    reconnect: Option<PendingReconnect>,
    /// Commands deferred while reconnecting, replayed in order
    queued: VecDeque<Command>,
}

impl SessionActor {
    async fn run(&mut self) {
        loop {
            let reconnect_at = self.reconnect.as_ref().map(|p| p.at);
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        debug!("all session handles dropped");
                        self.shutdown("session handle dropped").await;
                        break;
                    }
                },

                Some(ev) = self.signal_rx.recv() => {
                    if self.handle_signal_event(ev).await {
                        break;
                    }
                }

                Some(ev) = self.engine_rx.recv() => {
                    self.handle_engine_event(ev).await;
                }

                _ = sleep_until_opt(reconnect_at), if reconnect_at.is_some() => {
                    if self.run_reconnect_attempt().await {
                        break;
                    }
                }
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        debug!("emitting {}", event.name());
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            info!("session state -> {}", state.name());
            let _ = self.state_tx.send(state);
        }
    }

    fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == SessionState::Connected
    }

    /// Returns true when the actor must stop
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Disconnect => {
                let _ = self
                    .signal
                    .send(Envelope::Leave {
                        can_reconnect: false,
                        reason: "client disconnect".to_string(),
                    })
                    .await;
                self.shutdown("client disconnect").await;
                return true;
            }
            // Deadline ticks always run, even mid-reconnect
            Command::PublishTimeout { cid } => {
                self.reconciler.fail_publish(&cid, PublishError::AckTimeout);
            }
            Command::RpcTimeout { id } => {
                self.rpc.expire(&id);
            }
            // Handler registration is purely local
            Command::RegisterRpcHandler { method, handler } => {
                self.rpc.register_handler(&method, handler);
            }
            cmd if !self.is_connected() => {
                debug!("deferring command while not connected");
                self.queued.push_back(cmd);
            }
            Command::Publish { track, reply } => self.handle_publish(track, reply).await,
            Command::Unpublish { track_id } => {
                if let Some(request) = self.reconciler.unpublish(&track_id) {
                    if let Err(e) = self.signal.send(request).await {
                        warn!("unpublish request failed: {}", e);
                    }
                    self.start_publish_negotiation().await;
                }
            }
            Command::SetSubscribed {
                track_id,
                subscribe,
            } => {
                if let Some((request, event)) = self.reconciler.set_subscribed(&track_id, subscribe)
                {
                    if let Err(e) = self.signal.send(request).await {
                        warn!("subscription update failed: {}", e);
                    }
                    self.emit(event);
                }
            }
            Command::SendData { payload, lossy } => {
                let packet = DataPacket::User {
                    participant_sid: None,
                    payload: payload.to_vec(),
                };
                if let Err(e) = self.engine.send_packet(&packet, lossy).await {
                    warn!("data send failed: {}", e);
                }
            }
            Command::PerformRpc {
                target,
                method,
                payload,
                timeout,
                reply,
            } => {
                self.handle_perform_rpc(target, method, payload, timeout, reply)
                    .await
            }
            Command::Simulate(scenario) => self.handle_simulate(scenario).await,
        }
        false
    }

    async fn handle_publish(
        &mut self,
        track: LocalTrack,
        reply: oneshot::Sender<Result<TrackId, PublishError>>,
    ) {
        let cid = new_cid();
        let pending = PendingPublication {
            cid: cid.clone(),
            track,
            reply,
        };
        match self.reconciler.begin_publish(pending) {
            Ok(request) => {
                if let Err(e) = self.signal.send(request).await {
                    self.reconciler.fail_publish(&cid, PublishError::Signal(e));
                    return;
                }
                let cmd_tx = self.cmd_tx.clone();
                let timeout = self.config.publish_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = cmd_tx.send(Command::PublishTimeout { cid });
                });
            }
            Err(pending) => {
                let cid = pending.cid.clone();
                let _ = pending.reply.send(Err(PublishError::DuplicateCid(cid)));
            }
        }
    }

    async fn handle_perform_rpc(
        &mut self,
        target: String,
        method: String,
        payload: Bytes,
        timeout: Duration,
        reply: oneshot::Sender<Result<Bytes, RpcError>>,
    ) {
        let (frame, id, rx) = self.rpc.begin(&self.local_sid, &target, &method, payload);
        if let Err(e) = self
            .engine
            .send_packet(&DataPacket::Rpc(frame), false)
            .await
        {
            self.rpc.fail(&id, RpcError::Transport(e.to_string()));
        } else {
            let cmd_tx = self.cmd_tx.clone();
            let timer_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = cmd_tx.send(Command::RpcTimeout { id: timer_id });
            });
        }
        tokio::spawn(async move {
            let result = rx.await.unwrap_or(Err(RpcError::Aborted));
            let _ = reply.send(result);
        });
    }

    async fn handle_simulate(&mut self, scenario: SimulateScenario) {
        match scenario {
            SimulateScenario::NodeFailure { leg } => {
                self.engine.simulate_leg_failure(leg);
            }
            other => {
                if let Err(e) = self.signal.send(Envelope::SimulateScenario(other)).await {
                    warn!("simulate request failed: {}", e);
                }
            }
        }
    }

    /// Returns true when the actor must stop
    async fn handle_signal_event(&mut self, event: SignalEvent) -> bool {
        match event {
            SignalEvent::ChannelFailed { reason } => {
                warn!("control channel failed: {}", reason);
                self.schedule_reconnect(ReconnectMode::Resume, reason);
                false
            }
            SignalEvent::Frame(env) => self.handle_frame(env).await,
        }
    }

    async fn handle_frame(&mut self, env: Envelope) -> bool {
        debug!("signal frame: {}", env.name());
        match env {
            Envelope::Offer(SessionDescription { sdp, .. }) => {
                match self.engine.handle_offer(sdp).await {
                    Ok(answer) => {
                        self.last_answer_sdp = Some(answer.clone());
                        let reply = Envelope::Answer(SessionDescription {
                            leg: LegKind::Subscribe,
                            sdp: answer,
                        });
                        if let Err(e) = self.signal.send(reply).await {
                            warn!("answer send failed: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("subscribe-leg offer failed: {}", e);
                        self.schedule_reconnect(ReconnectMode::Full, e.to_string());
                    }
                }
            }
            Envelope::Answer(SessionDescription { leg, sdp }) => {
                match self.engine.handle_answer(leg, sdp).await {
                    Ok(true) => self.start_publish_negotiation().await,
                    Ok(false) => {}
                    Err(e) => {
                        error!("{} answer failed: {}", leg.name(), e);
                        self.schedule_reconnect(ReconnectMode::Full, e.to_string());
                    }
                }
            }
            Envelope::Trickle(trickle) => {
                if let Err(e) = self.engine.add_candidate(trickle.leg, trickle.candidate).await {
                    warn!("candidate rejected: {}", e);
                }
            }
            Envelope::TrackPublished(info) => {
                if info.participant_sid == self.local_sid {
                    if self.reconciler.complete_publish(info) {
                        // Acknowledged publications need a fresh offer
                        self.start_publish_negotiation().await;
                    }
                } else {
                    let auto = self.config.auto_subscribe;
                    let track_id = info.track_id.clone();
                    if let Some(event) = self.reconciler.add_remote_track(info) {
                        self.emit(event);
                        if auto {
                            self.subscribe_track(&track_id).await;
                        }
                    }
                }
            }
            Envelope::TrackUnpublished { track_id } => {
                for event in self.reconciler.remove_remote_track(&track_id) {
                    self.emit(event);
                }
            }
            Envelope::Mute { track_id, muted } => {
                if let Some(event) = self.reconciler.set_muted(&track_id, muted) {
                    self.emit(event);
                }
            }
            Envelope::ParticipantUpdate(participants) => {
                self.apply_roster(&participants);
            }
            Envelope::SubscriptionPermission { track_id, allowed } => {
                if let Some(event) = self.reconciler.set_permission(&track_id, allowed) {
                    self.emit(event);
                }
            }
            Envelope::StreamStateUpdate(updates) => {
                for update in updates {
                    if let Some(event) = self.reconciler.set_stream_state(&update.track_id, update.state) {
                        self.emit(event);
                    }
                }
            }
            Envelope::SpeakerUpdate(speakers) => {
                self.emit(SessionEvent::ActiveSpeakersChanged { speakers });
            }
            Envelope::Leave {
                can_reconnect,
                reason,
            } => {
                if can_reconnect {
                    info!("server requested reconnect: {}", reason);
                    self.schedule_reconnect(ReconnectMode::Full, reason);
                } else {
                    info!("server closed the session: {}", reason);
                    self.shutdown(&reason).await;
                    return true;
                }
            }
            Envelope::SimulateScenario(scenario) => {
                // Server-echoed chaos hook
                Box::pin(self.handle_simulate(scenario)).await;
            }
            Envelope::Error { code, message } => {
                warn!("server error {}: {}", code, message);
            }
            other => {
                debug!("ignoring {} frame", other.name());
            }
        }
        false
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LegState { leg, state } => {
                debug!("{} leg -> {}", leg.name(), state.name());
            }
            EngineEvent::LegFailed { leg } => {
                warn!("{} leg failed", leg.name());
                self.schedule_reconnect(
                    ReconnectMode::Full,
                    format!("{} transport leg failed", leg.name()),
                );
            }
            EngineEvent::PacketReceived { packet, lossy } => match packet {
                DataPacket::User {
                    participant_sid,
                    payload,
                } => {
                    self.emit(SessionEvent::DataReceived {
                        participant_sid,
                        payload: Bytes::from(payload),
                        lossy,
                    });
                }
                DataPacket::Rpc(frame) => {
                    if let Some(reply) = self.rpc.handle_frame(&self.local_sid, frame) {
                        if let Err(e) = self
                            .engine
                            .send_packet(&DataPacket::Rpc(reply), false)
                            .await
                        {
                            warn!("rpc reply send failed: {}", e);
                        }
                    }
                }
            },
        }
    }

    /// Reconcile a roster push: joins, leaves, and per-participant tracks
    fn apply_roster(&mut self, participants: &[ParticipantInfo]) {
        let mut events = Vec::new();
        let mut auto_subscribe_ids = Vec::new();
        for p in participants {
            if p.sid == self.local_sid {
                continue;
            }
            if !p.active {
                if let Some(idx) = self.participants.iter().position(|sid| *sid == p.sid) {
                    self.participants.remove(idx);
                    events.extend(self.reconciler.remove_participant(&p.sid));
                    self.rpc.on_participant_left(&p.sid);
                    events.push(SessionEvent::ParticipantLeft { sid: p.sid.clone() });
                }
                continue;
            }
            if !self.participants.contains(&p.sid) {
                self.participants.push(p.sid.clone());
                events.push(SessionEvent::ParticipantJoined {
                    sid: p.sid.clone(),
                    identity: p.identity.clone(),
                    name: p.name.clone(),
                });
            }
            for event in self.reconciler.apply_participant_tracks(p) {
                if self.config.auto_subscribe {
                    if let SessionEvent::TrackPublished { track, .. } = &event {
                        auto_subscribe_ids.push(track.track_id.clone());
                    }
                }
                events.push(event);
            }
        }
        for event in events {
            self.emit(event);
        }
        for track_id in auto_subscribe_ids {
            // Queue the subscribe through the command channel so it runs
            // after the roster is fully applied
            let _ = self.cmd_tx.send(Command::SetSubscribed {
                track_id,
                subscribe: true,
            });
        }
    }

    /// Apply an authoritative roster (join or resume baseline): known
    /// participants absent from the list have departed, unlike incremental
    /// `ParticipantUpdate` pushes where departures arrive as tombstones.
    fn apply_full_roster(&mut self, participants: &[ParticipantInfo]) {
        let present: HashSet<&str> = participants
            .iter()
            .filter(|p| p.active)
            .map(|p| p.sid.as_str())
            .collect();
        let gone: Vec<String> = self
            .participants
            .iter()
            .filter(|sid| !present.contains(sid.as_str()))
            .cloned()
            .collect();
        for sid in gone {
            debug!("participant {} departed during the outage", sid);
            self.participants.retain(|s| *s != sid);
            for event in self.reconciler.remove_participant(&sid) {
                self.emit(event);
            }
            self.rpc.on_participant_left(&sid);
            self.emit(SessionEvent::ParticipantLeft { sid });
        }
        self.apply_roster(participants);
    }

    async fn subscribe_track(&mut self, track_id: &str) {
        if let Some((request, event)) = self.reconciler.set_subscribed(track_id, true) {
            if let Err(e) = self.signal.send(request).await {
                warn!("subscription update failed: {}", e);
            }
            self.emit(event);
        }
    }

    /// Kick a publish-leg offer/answer cycle, coalescing with any in flight
    async fn start_publish_negotiation(&mut self) {
        match self.engine.negotiate_publish().await {
            Ok(Some(sdp)) => {
                let offer = Envelope::Offer(SessionDescription {
                    leg: LegKind::Publish,
                    sdp,
                });
                if let Err(e) = self.signal.send(offer).await {
                    warn!("offer send failed: {}", e);
                }
            }
            Ok(None) => {} // coalesced into the in-flight cycle
            Err(e) => {
                error!("publish negotiation failed: {}", e);
                self.schedule_reconnect(ReconnectMode::Full, e.to_string());
            }
        }
    }

    fn schedule_reconnect(&mut self, mode: ReconnectMode, reason: String) {
        if *self.state_tx.borrow() == SessionState::Disconnected {
            return;
        }
        if self.reconnect.is_some() {
            // Already retrying; a harder failure only escalates the mode
            let escalated = match &mut self.reconnect {
                Some(pending) if mode == ReconnectMode::Full && pending.mode == ReconnectMode::Resume => {
                    pending.mode = ReconnectMode::Full;
                    true
                }
                _ => false,
            };
            if escalated {
                debug!("escalating pending resume to full reconnect: {}", reason);
                self.set_state(SessionState::Reconnecting { full: true });
            }
            return;
        }

        let started = Instant::now();
        let ctx = ReconnectContext {
            attempt: 0,
            elapsed: Duration::ZERO,
            reason: reason.clone(),
            url: self.url.clone(),
        };
        match self.config.reconnect_policy.next_delay(&ctx) {
            Some(delay) => {
                info!(
                    "scheduling {} reconnect in {:?}: {}",
                    if mode == ReconnectMode::Full { "full" } else { "resume" },
                    delay,
                    reason
                );
                self.reconnect = Some(PendingReconnect {
                    mode,
                    attempt: 0,
                    started,
                    at: started + delay,
                    reason,
                });
                self.set_state(SessionState::Reconnecting {
                    full: mode == ReconnectMode::Full,
                });
                self.emit(SessionEvent::Reconnecting);
            }
            None => {
                // Zero-budget policy: immediately terminal
                self.reconnect = Some(PendingReconnect {
                    mode,
                    attempt: 0,
                    started,
                    at: started,
                    reason,
                });
                self.emit(SessionEvent::Reconnecting);
                self.set_state(SessionState::Reconnecting {
                    full: mode == ReconnectMode::Full,
                });
            }
        }
    }

    /// One reconnect attempt. Returns true when the actor must stop.
    async fn run_reconnect_attempt(&mut self) -> bool {
        let Some(mut pending) = self.reconnect.take() else {
            return false;
        };

        // A zero-budget policy refuses even the first attempt
        if pending.attempt == 0 {
            let ctx = ReconnectContext {
                attempt: 0,
                elapsed: pending.started.elapsed(),
                reason: pending.reason.clone(),
                url: self.url.clone(),
            };
            if self.config.reconnect_policy.next_delay(&ctx).is_none() {
                let reason = format!("reconnect budget exhausted: {}", pending.reason);
                self.terminate(&reason).await;
                return true;
            }
        }

        let attempt = pending.attempt;
        pending.attempt += 1;
        info!(
            "reconnect attempt {} ({})",
            attempt + 1,
            if pending.mode == ReconnectMode::Full { "full" } else { "resume" }
        );

        let succeeded = match pending.mode {
            ReconnectMode::Resume => match self.try_resume().await {
                Ok(()) => true,
                Err(SignalError::ResumeRejected(reason)) => {
                    // Never retry a rejected resume; the next attempt is full
                    warn!("resume rejected, falling back to full reconnect: {}", reason);
                    pending.mode = ReconnectMode::Full;
                    self.set_state(SessionState::Reconnecting { full: true });
                    false
                }
                Err(e) => {
                    warn!("resume attempt failed: {}", e);
                    false
                }
            },
            ReconnectMode::Full => match self.try_full_reconnect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("full reconnect attempt failed: {}", e);
                    false
                }
            },
        };

        if succeeded {
            self.set_state(SessionState::Connected);
            self.emit(SessionEvent::Reconnected);
            self.flush_queued_commands().await;
            return false;
        }

        let ctx = ReconnectContext {
            attempt: pending.attempt,
            elapsed: pending.started.elapsed(),
            reason: pending.reason.clone(),
            url: self.url.clone(),
        };
        match self.config.reconnect_policy.next_delay(&ctx) {
            Some(delay) => {
                debug!("next reconnect attempt in {:?}", delay);
                pending.at = Instant::now() + delay;
                self.reconnect = Some(pending);
                false
            }
            None => {
                let reason = format!(
                    "reconnect budget exhausted after {} attempts: {}",
                    pending.attempt, pending.reason
                );
                self.terminate(&reason).await;
                true
            }
        }
    }

    async fn try_resume(&mut self) -> Result<(), SignalError> {
        let snapshot = self.reconciler.snapshot(
            self.last_answer_sdp.clone(),
            self.engine.data_channel_descriptors(),
        );
        let url = self
            .signal_session
            .alternate_url
            .clone()
            .unwrap_or_else(|| self.url.clone());
        let resp = self
            .signal
            .resume(
                &url,
                &self.signal_session.reconnect_token.clone(),
                snapshot,
                self.config.join_timeout,
            )
            .await?;

        self.signal_session.reconnect_token = resp.reconnect_token;
        self.signal.restart_heartbeat(
            self.signal_session.ping_interval,
            self.signal_session.ping_timeout,
        );
        let participants = resp.participants;
        self.apply_full_roster(&participants);
        Ok(())
    }

    async fn try_full_reconnect(&mut self) -> Result<(), ConnectError> {
        self.engine.teardown().await;

        let (signal_session, join) = self
            .signal
            .connect(
                &self.url,
                &self.token,
                self.config.client.clone(),
                PROTOCOL_VERSION,
                self.config.auto_subscribe,
                self.config.join_timeout,
            )
            .await?;

        let ice = merge_ice_servers(&self.config.ice_servers, &signal_session.ice_servers);
        self.engine
            .build(&ice)
            .await
            .map_err(|e| ConnectError::Unreachable(format!("transport rebuild: {}", e)))?;

        self.signal_session = signal_session;
        self.local_sid = join.participant.sid.clone();
        self.last_answer_sdp = None;

        let others = join.others.clone();
        self.apply_full_roster(&others);

        // Replay local publications and the subscription set
        for request in self.reconciler.replay_requests() {
            if let Err(e) = self.signal.send(request).await {
                warn!("replay request failed: {}", e);
            }
        }
        self.start_publish_negotiation().await;
        Ok(())
    }

    async fn flush_queued_commands(&mut self) {
        let queued: Vec<Command> = self.queued.drain(..).collect();
        if !queued.is_empty() {
            debug!("replaying {} deferred commands", queued.len());
        }
        for cmd in queued {
            // Disconnect cannot be queued, so the return value is unused
            let _ = self.handle_command(cmd).await;
        }
    }

    /// Terminal failure path: fail everything outstanding and stop
    async fn terminate(&mut self, reason: &str) {
        error!("session terminated: {}", reason);
        self.shutdown(reason).await;
    }

    async fn shutdown(&mut self, reason: &str) {
        self.reconnect = None;
        self.rpc.fail_all(RpcError::NotConnected);
        self.reconciler.fail_all_pending(reason);
        for cmd in self.queued.drain(..) {
            fail_command(cmd);
        }
        self.signal.close().await;
        self.engine.teardown().await;
        self.set_state(SessionState::Disconnected);
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

/// Fail a deferred command's waiter on terminal shutdown
fn fail_command(cmd: Command) {
    match cmd {
        Command::Publish { reply, .. } => {
            let _ = reply.send(Err(PublishError::NotConnected));
        }
        Command::PerformRpc { reply, .. } => {
            let _ = reply.send(Err(RpcError::NotConnected));
        }
        _ => {}
    }
}

fn merge_ice_servers(local: &[IceServer], server: &[IceServer]) -> Vec<IceServer> {
    let mut merged: Vec<IceServer> = server.to_vec();
    for s in local {
        if !merged.contains(s) {
            merged.push(s.clone());
        }
    }
    merged
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
