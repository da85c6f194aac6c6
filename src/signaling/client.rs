//! Signaling client
//!
//! Owns the control-channel connection and the join/resume handshakes.
//! Push frames are forwarded in arrival order on an event channel; the few
//! request/response exchanges the protocol has (join, resume, ping) are
//! correlated through a waiter table. Non-critical outbound requests are
//! queued while disconnected and flushed on (re)join; join and resume are
//! never queued because they define the transition itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, SignalError};
use crate::proto::{
    ClientInfo, Envelope, IceServer, JoinRequest, JoinResponse, ResumeRequest, ResumeResponse,
    SyncSnapshot,
};
use crate::signaling::stream::{ControlDial, ControlStream};

/// Signaling connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Idle,
    Connecting,
    Joined,
    Reconnecting,
    Closed,
}

/// Events surfaced to the session actor
#[derive(Debug)]
pub enum SignalEvent {
    /// Push frame, delivered in arrival order
    Frame(Envelope),
    /// The control channel failed (stream closed or heartbeat timed out)
    ChannelFailed { reason: String },
}

/// Immutable per-connection parameters. Superseded wholesale on each
/// successful join or resume, never mutated in place.
#[derive(Debug, Clone)]
pub struct SignalingSession {
    pub url: String,
    pub token: String,
    pub protocol_version: u32,
    pub reconnect_token: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub ice_servers: Vec<IceServer>,
    pub subscriber_primary: bool,
    pub alternate_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ResponseKey {
    Join,
    Resume,
    Pong,
}

struct Shared {
    state: parking_lot::RwLock<SignalState>,
    stream: parking_lot::Mutex<Option<Arc<dyn ControlStream>>>,
    queue: parking_lot::Mutex<VecDeque<Envelope>>,
    pending: parking_lot::Mutex<HashMap<ResponseKey, oneshot::Sender<Envelope>>>,
    event_tx: mpsc::UnboundedSender<SignalEvent>,
}

impl Shared {
    fn register(&self, key: ResponseKey) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);
        rx
    }

    fn resolve(&self, key: ResponseKey, env: Envelope) -> bool {
        if let Some(tx) = self.pending.lock().remove(&key) {
            let _ = tx.send(env);
            true
        } else {
            false
        }
    }

    fn fail_all_pending(&self) {
        // Dropping the senders wakes every waiter with a recv error
        self.pending.lock().clear();
    }
}

/// Signaling client. One per session; reconnected in place across resume
/// and full reconnects.
pub struct SignalingClient {
    shared: Arc<Shared>,
    dialer: Arc<dyn ControlDial>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Create a client and the event receiver the session actor selects on
    pub fn new(dialer: Arc<dyn ControlDial>) -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: parking_lot::RwLock::new(SignalState::Idle),
            stream: parking_lot::Mutex::new(None),
            queue: parking_lot::Mutex::new(VecDeque::new()),
            pending: parking_lot::Mutex::new(HashMap::new()),
            event_tx,
        });
        (
            Self {
                shared,
                dialer,
                tasks: parking_lot::Mutex::new(Vec::new()),
            },
            event_rx,
        )
    }

    pub fn state(&self) -> SignalState {
        *self.shared.state.read()
    }

    /// Perform the initial join handshake
    pub async fn connect(
        &self,
        url: &str,
        token: &str,
        client: ClientInfo,
        protocol_version: u32,
        auto_subscribe: bool,
        join_timeout: Duration,
    ) -> Result<(SignalingSession, JoinResponse), ConnectError> {
        *self.shared.state.write() = SignalState::Connecting;
        // A full reconnect re-enters here with a dead stream still installed
        self.teardown_connection().await;

        let stream = self.dialer.dial(url).await?;
        self.install_stream(Arc::clone(&stream));

        let rx = self.shared.register(ResponseKey::Join);
        stream
            .send(Envelope::Join(JoinRequest {
                token: token.to_string(),
                protocol_version,
                auto_subscribe,
                client,
            }))
            .await
            .map_err(ConnectError::Signal)?;

        let resp = match tokio::time::timeout(join_timeout, rx).await {
            Err(_) => {
                self.shared.pending.lock().remove(&ResponseKey::Join);
                return Err(ConnectError::Timeout);
            }
            Ok(Err(_)) => return Err(ConnectError::Signal(SignalError::Closed)),
            Ok(Ok(Envelope::JoinAck(resp))) => resp,
            Ok(Ok(Envelope::Error { code, message })) => {
                return Err(ConnectError::JoinRejected { code, message })
            }
            Ok(Ok(other)) => {
                return Err(ConnectError::Signal(SignalError::Stream(format!(
                    "unexpected {} during join",
                    other.name()
                ))))
            }
        };

        if resp.protocol_version != protocol_version {
            return Err(ConnectError::VersionMismatch {
                server: resp.protocol_version,
                client: protocol_version,
            });
        }

        let session = SignalingSession {
            url: url.to_string(),
            token: token.to_string(),
            protocol_version: resp.protocol_version,
            reconnect_token: resp.reconnect_token.clone(),
            ping_interval: Duration::from_millis(resp.ping_interval_ms),
            ping_timeout: Duration::from_millis(resp.ping_timeout_ms),
            ice_servers: resp.ice_servers.clone(),
            subscriber_primary: resp.subscriber_primary,
            alternate_url: resp.alternate_url.clone(),
        };

        *self.shared.state.write() = SignalState::Joined;
        info!("signaling joined: {}", url);
        self.start_heartbeat(session.ping_interval, session.ping_timeout);
        self.flush_queue().await;

        Ok((session, resp))
    }

    /// Perform a resume handshake on a fresh stream, sending the reconnect
    /// token and the session snapshot. A server rejection comes back as
    /// [`SignalError::ResumeRejected`]; the caller must then fall back to a
    /// full reconnect rather than retrying the resume.
    pub async fn resume(
        &self,
        url: &str,
        reconnect_token: &str,
        snapshot: SyncSnapshot,
        join_timeout: Duration,
    ) -> Result<ResumeResponse, SignalError> {
        *self.shared.state.write() = SignalState::Reconnecting;
        self.teardown_connection().await;

        let stream = self
            .dialer
            .dial(url)
            .await
            .map_err(|e| SignalError::Stream(e.to_string()))?;
        self.install_stream(Arc::clone(&stream));

        let rx = self.shared.register(ResponseKey::Resume);
        stream
            .send(Envelope::Resume(ResumeRequest {
                reconnect_token: reconnect_token.to_string(),
                snapshot,
            }))
            .await?;

        let resp = match tokio::time::timeout(join_timeout, rx).await {
            Err(_) => {
                self.shared.pending.lock().remove(&ResponseKey::Resume);
                return Err(SignalError::Timeout);
            }
            Ok(Err(_)) => return Err(SignalError::Closed),
            Ok(Ok(Envelope::ResumeAck(resp))) => resp,
            Ok(Ok(Envelope::Error { message, .. })) => {
                return Err(SignalError::ResumeRejected(message))
            }
            Ok(Ok(other)) => {
                return Err(SignalError::Stream(format!(
                    "unexpected {} during resume",
                    other.name()
                )))
            }
        };

        *self.shared.state.write() = SignalState::Joined;
        info!("signaling resumed: {}", url);
        self.flush_queue().await;

        Ok(resp)
    }

    /// Restart the heartbeat with the parameters of the superseding
    /// signaling session. Called by the session after a successful resume.
    pub fn restart_heartbeat(&self, interval: Duration, timeout: Duration) {
        self.start_heartbeat(interval, timeout);
    }

    /// Send a non-critical request. Queued in arrival order while the
    /// client is not joined; flushed on the next successful (re)join.
    pub async fn send(&self, env: Envelope) -> Result<(), SignalError> {
        debug_assert!(
            !matches!(env, Envelope::Join(_) | Envelope::Resume(_)),
            "join/resume must go through connect/resume"
        );
        let state = *self.shared.state.read();
        if state == SignalState::Closed {
            return Err(SignalError::Closed);
        }
        let stream = self.shared.stream.lock().clone();
        match (state, stream) {
            (SignalState::Joined, Some(stream)) => stream.send(env).await,
            _ => {
                debug!("queueing {} while disconnected", env.name());
                self.shared.queue.lock().push_back(env);
                Ok(())
            }
        }
    }

    /// Close the client. Queued requests are dropped and every pending
    /// request waiter is failed, never silently.
    pub async fn close(&self) {
        *self.shared.state.write() = SignalState::Closed;
        let dropped = self.shared.queue.lock().len();
        if dropped > 0 {
            warn!("dropping {} queued signaling requests on close", dropped);
        }
        self.shared.queue.lock().clear();
        self.shared.fail_all_pending();
        self.teardown_connection().await;
    }

    fn install_stream(&self, stream: Arc<dyn ControlStream>) {
        *self.shared.stream.lock() = Some(Arc::clone(&stream));
        let shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Some(env) => route_frame(&shared, env),
                    None => {
                        if *shared.state.read() != SignalState::Closed {
                            let _ = shared.event_tx.send(SignalEvent::ChannelFailed {
                                reason: "control stream closed".to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(reader);
    }

    fn start_heartbeat(&self, interval: Duration, timeout: Duration) {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let stream = match shared.stream.lock().clone() {
                    Some(s) => s,
                    None => break,
                };
                let rx = shared.register(ResponseKey::Pong);
                let ping = Envelope::Ping {
                    timestamp_ms: now_ms(),
                };
                if stream.send(ping).await.is_err() {
                    break;
                }
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(_)) => {}
                    _ => {
                        warn!("heartbeat timed out after {:?}", timeout);
                        let _ = shared.event_tx.send(SignalEvent::ChannelFailed {
                            reason: "heartbeat timeout".to_string(),
                        });
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    async fn flush_queue(&self) {
        let queued: Vec<Envelope> = self.shared.queue.lock().drain(..).collect();
        if queued.is_empty() {
            return;
        }
        debug!("flushing {} queued signaling requests", queued.len());
        let stream = self.shared.stream.lock().clone();
        if let Some(stream) = stream {
            for env in queued {
                if let Err(e) = stream.send(env).await {
                    warn!("failed to flush queued request: {}", e);
                    break;
                }
            }
        }
    }

    async fn teardown_connection(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let stream = self.shared.stream.lock().take();
        if let Some(stream) = stream {
            stream.close().await;
        }
    }
}

/// Route one incoming frame: handshake and ping responses resolve their
/// waiters, everything else is pushed to the session in arrival order.
fn route_frame(shared: &Arc<Shared>, env: Envelope) {
    match env {
        Envelope::JoinAck(_) => {
            if !shared.resolve(ResponseKey::Join, env) {
                warn!("unsolicited join_ack dropped");
            }
        }
        Envelope::ResumeAck(_) => {
            if !shared.resolve(ResponseKey::Resume, env) {
                warn!("unsolicited resume_ack dropped");
            }
        }
        Envelope::Pong { .. } => {
            shared.resolve(ResponseKey::Pong, env);
        }
        Envelope::Error { .. } => {
            // During a handshake the error frame is the response
            if shared.resolve(ResponseKey::Join, env.clone()) {
                return;
            }
            if shared.resolve(ResponseKey::Resume, env.clone()) {
                return;
            }
            let _ = shared.event_tx.send(SignalEvent::Frame(env));
        }
        other => {
            let _ = shared.event_tx.send(SignalEvent::Frame(other));
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
