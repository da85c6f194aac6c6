//! Control-channel streams
//!
//! [`ControlStream`] abstracts the ordered, reliable channel the signaling
//! client runs over. Production uses a WebSocket carrying one encoded
//! envelope per binary message; tests use an in-memory pair that still
//! round-trips through the wire codec.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::error::{ConnectError, SignalError};
use crate::proto::{decode_envelope, encode_envelope, Envelope};

/// One ordered, reliable control channel
#[async_trait]
pub trait ControlStream: Send + Sync {
    /// Send one envelope; fails once the stream is closed
    async fn send(&self, env: Envelope) -> Result<(), SignalError>;

    /// Receive the next envelope, or `None` once the stream is closed
    async fn recv(&self) -> Option<Envelope>;

    /// Close the stream; in-flight receives resolve to `None`
    async fn close(&self);
}

/// Dialer capability so the connection mechanism is injectable
#[async_trait]
pub trait ControlDial: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Arc<dyn ControlStream>, ConnectError>;
}

/// WebSocket control stream: each binary message carries exactly one
/// length-prefixed envelope
pub struct WsControlStream {
    out_tx: mpsc::Sender<Vec<u8>>,
    in_rx: Mutex<mpsc::Receiver<Envelope>>,
    closed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WsControlStream {
    /// Dial `url` and split the socket into writer and reader tasks
    pub async fn connect(url: &str) -> Result<Self, ConnectError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ConnectError::Unreachable(format!("invalid url {}: {}", url, e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ConnectError::Unreachable(format!(
                "unsupported control-channel scheme: {}",
                parsed.scheme()
            )));
        }
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        debug!("control channel connected: {}", url);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (in_tx, in_rx) = mpsc::channel::<Envelope>(256);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Binary(frame)).await {
                    warn!("control channel write failed: {}", e);
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match decode_envelope(&data) {
                        Ok((env, _)) => {
                            if in_tx.send(env).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("dropping undecodable signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("control channel read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            out_tx,
            in_rx: Mutex::new(in_rx),
            closed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(vec![writer, reader]),
        })
    }
}

#[async_trait]
impl ControlStream for WsControlStream {
    async fn send(&self, env: Envelope) -> Result<(), SignalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalError::Closed);
        }
        let frame = encode_envelope(&env)?;
        self.out_tx
            .send(frame.to_vec())
            .await
            .map_err(|_| SignalError::Stream("writer task ended".to_string()))
    }

    async fn recv(&self) -> Option<Envelope> {
        self.in_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Default dialer backed by [`WsControlStream`]
pub struct WsDialer;

#[async_trait]
impl ControlDial for WsDialer {
    async fn dial(&self, url: &str) -> Result<Arc<dyn ControlStream>, ConnectError> {
        Ok(Arc::new(WsControlStream::connect(url).await?))
    }
}

/// In-memory control stream for tests; frames still pass through the
/// envelope codec so wire-shape bugs surface in unit tests
pub struct MemoryControlStream {
    out_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    in_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Create a cross-wired pair of in-memory control streams
pub fn memory_pair() -> (MemoryControlStream, MemoryControlStream) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryControlStream {
            out_tx: parking_lot::Mutex::new(Some(a_tx)),
            in_rx: Mutex::new(b_rx),
        },
        MemoryControlStream {
            out_tx: parking_lot::Mutex::new(Some(b_tx)),
            in_rx: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl ControlStream for MemoryControlStream {
    async fn send(&self, env: Envelope) -> Result<(), SignalError> {
        let frame = encode_envelope(&env)?;
        let guard = self.out_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame.to_vec())
                .map_err(|_| SignalError::Stream("peer closed".to_string())),
            None => Err(SignalError::Closed),
        }
    }

    async fn recv(&self) -> Option<Envelope> {
        let frame = self.in_rx.lock().await.recv().await?;
        match decode_envelope(&frame) {
            Ok((env, _)) => Some(env),
            Err(e) => {
                warn!("dropping undecodable in-memory frame: {}", e);
                None
            }
        }
    }

    async fn close(&self) {
        self.out_tx.lock().take();
    }
}
