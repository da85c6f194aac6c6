//! Shared fakes for the integration tests: a scripted control-channel
//! dialer backed by in-memory streams, and a scripted per-leg transport
//! whose data channels can be observed and injected into.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use roomlink::error::{ConnectError, TransportError};
use roomlink::events::SessionEvent;
use roomlink::proto::{
    Envelope, IceCandidate, IceServer, JoinResponse, LegKind, ParticipantInfo, TrackInfo,
    TrackKind,
};
use roomlink::signaling::stream::{memory_pair, ControlDial, ControlStream, MemoryControlStream};
use roomlink::transport::capability::{
    DataChannelHandle, LegConnectionState, PeerTransport, PeerTransportFactory, SdpKind,
};

static TRACING: Once = Once::new();

/// Opt-in test logging: `RUST_LOG=roomlink=debug cargo test -- --nocapture`
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Dialer producing one in-memory stream per dial; the server ends are
/// delivered on a channel so the test can script them. Dials beyond
/// `max_dials` fail as unreachable.
pub struct ScriptedDialer {
    server_tx: mpsc::UnboundedSender<MemoryControlStream>,
    dials: AtomicUsize,
    max_dials: usize,
}

impl ScriptedDialer {
    pub fn new(max_dials: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryControlStream>) {
        init_tracing();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                server_tx,
                dials: AtomicUsize::new(0),
                max_dials,
            }),
            server_rx,
        )
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlDial for ScriptedDialer {
    async fn dial(&self, _url: &str) -> Result<Arc<dyn ControlStream>, ConnectError> {
        let n = self.dials.fetch_add(1, Ordering::SeqCst);
        if n >= self.max_dials {
            return Err(ConnectError::Unreachable("no server".to_string()));
        }
        let (client, server) = memory_pair();
        self.server_tx
            .send(server)
            .map_err(|_| ConnectError::Unreachable("server task gone".to_string()))?;
        Ok(Arc::new(client))
    }
}

/// Canned join response with `PA_local` as the local participant
pub fn join_response(others: Vec<ParticipantInfo>) -> JoinResponse {
    JoinResponse {
        protocol_version: 1,
        participant: participant("PA_local", vec![]),
        others,
        reconnect_token: "rt_1".to_string(),
        ping_interval_ms: 30_000,
        ping_timeout_ms: 15_000,
        ice_servers: vec![],
        subscriber_primary: true,
        alternate_url: None,
    }
}

pub fn participant(sid: &str, tracks: Vec<TrackInfo>) -> ParticipantInfo {
    ParticipantInfo {
        sid: sid.to_string(),
        identity: sid.to_lowercase(),
        name: sid.to_lowercase(),
        tracks,
        active: true,
    }
}

pub fn departed(sid: &str) -> ParticipantInfo {
    ParticipantInfo {
        active: false,
        ..participant(sid, vec![])
    }
}

pub fn remote_track(sid: &str, track_id: &str) -> TrackInfo {
    TrackInfo {
        track_id: track_id.to_string(),
        cid: String::new(),
        kind: TrackKind::Video,
        name: "cam".to_string(),
        muted: false,
        participant_sid: sid.to_string(),
    }
}

/// Answer the client's join request on a fresh server-side stream
pub async fn serve_join(server: &MemoryControlStream, resp: JoinResponse) {
    match server.recv().await {
        Some(Envelope::Join(_)) => server.send(Envelope::JoinAck(resp)).await.unwrap(),
        other => panic!("expected join, got {:?}", other.map(|e| e.name())),
    }
}

/// Receive frames until one satisfies the predicate, answering pings and
/// skipping everything else
pub async fn recv_matching<F>(server: &MemoryControlStream, mut pred: F) -> Envelope
where
    F: FnMut(&Envelope) -> bool,
{
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match server.recv().await {
                Some(Envelope::Ping { timestamp_ms }) => {
                    let _ = server.send(Envelope::Pong { timestamp_ms }).await;
                }
                Some(env) if pred(&env) => return env,
                Some(_) => {}
                None => panic!("server stream closed while waiting for frame"),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

/// Next session event, bounded
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one satisfies the predicate
pub async fn wait_for_event<F>(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut pred: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Scripted data channel: sends are forwarded to the test, receives are
/// injected by the test
pub struct FakeChannel {
    label: String,
    handler: parking_lot::Mutex<Option<Box<dyn Fn(Bytes) + Send + Sync>>>,
    sent_tx: mpsc::UnboundedSender<(String, Bytes)>,
}

impl FakeChannel {
    pub fn fire(&self, data: Bytes) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(data);
        }
    }
}

#[async_trait]
impl DataChannelHandle for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.sent_tx
            .send((self.label.clone(), data))
            .map_err(|_| TransportError::DataChannel("test observer gone".to_string()))
    }

    fn on_message(&self, handler: Box<dyn Fn(Bytes) + Send + Sync>) {
        *self.handler.lock() = Some(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Scripted per-leg transport recording every call in order
pub struct FakeTransport {
    pub kind: LegKind,
    pub calls: parking_lot::Mutex<Vec<String>>,
    state_tx: watch::Sender<LegConnectionState>,
    state_rx: watch::Receiver<LegConnectionState>,
    channels: parking_lot::Mutex<HashMap<String, Arc<FakeChannel>>>,
    sent_tx: mpsc::UnboundedSender<(String, Bytes)>,
}

impl FakeTransport {
    fn new(kind: LegKind, sent_tx: mpsc::UnboundedSender<(String, Bytes)>) -> Self {
        let (state_tx, state_rx) = watch::channel(LegConnectionState::New);
        Self {
            kind,
            calls: parking_lot::Mutex::new(Vec::new()),
            state_tx,
            state_rx,
            channels: parking_lot::Mutex::new(HashMap::new()),
            sent_tx,
        }
    }

    pub fn set_state(&self, state: LegConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Deliver an inbound message on one of the created data channels
    pub fn inject(&self, label: &str, data: Bytes) {
        let channel = self
            .channels
            .lock()
            .get(label)
            .cloned()
            .unwrap_or_else(|| panic!("no data channel labelled {}", label));
        channel.fire(data);
    }

    pub fn offer_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| *c == "create_offer")
            .count()
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.calls.lock().push("create_offer".to_string());
        Ok(format!("{}-offer", self.kind.name()))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.calls.lock().push("create_answer".to_string());
        Ok(format!("{}-answer", self.kind.name()))
    }

    async fn set_local_description(&self, kind: SdpKind, _sdp: String) -> Result<(), TransportError> {
        self.calls.lock().push(format!("set_local:{:?}", kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        _sdp: String,
    ) -> Result<(), TransportError> {
        self.calls.lock().push(format!("set_remote:{:?}", kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.calls
            .lock()
            .push(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _lossy: bool,
    ) -> Result<Arc<dyn DataChannelHandle>, TransportError> {
        let channel = Arc::new(FakeChannel {
            label: label.to_string(),
            handler: parking_lot::Mutex::new(None),
            sent_tx: self.sent_tx.clone(),
        });
        self.channels
            .lock()
            .insert(label.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    fn state_changes(&self) -> watch::Receiver<LegConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.calls.lock().push("close".to_string());
        Ok(())
    }
}

/// Factory handing each created transport back to the test. The engine
/// builds the publish leg first, then the subscribe leg.
pub struct FakeTransportFactory {
    created_tx: mpsc::UnboundedSender<Arc<FakeTransport>>,
    sent_tx: mpsc::UnboundedSender<(String, Bytes)>,
}

pub fn fake_transport_factory() -> (
    Arc<FakeTransportFactory>,
    mpsc::UnboundedReceiver<Arc<FakeTransport>>,
    mpsc::UnboundedReceiver<(String, Bytes)>,
) {
    let (created_tx, created_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        Arc::new(FakeTransportFactory {
            created_tx,
            sent_tx,
        }),
        created_rx,
        sent_rx,
    )
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        kind: LegKind,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(FakeTransport::new(kind, self.sent_tx.clone()));
        self.created_tx
            .send(Arc::clone(&transport))
            .map_err(|_| TransportError::Capability("test observer gone".to_string()))?;
        Ok(transport)
    }
}
