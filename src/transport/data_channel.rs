//! Data channel wrappers
//!
//! Two logical channels ride the publish leg: `_reliable` (ordered,
//! retransmitting; chat, byte streams, RPC framing) and `_lossy`
//! (unordered, no retransmission; high-frequency loss-tolerant signals).
//! Both are opened once per leg lifetime; a full reconnect recreates them,
//! a resume preserves their identity through the sync snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;
use crate::proto::DataChannelDescriptor;
use crate::transport::capability::DataChannelHandle;

/// Label of the ordered, retransmitting channel
pub const RELIABLE_LABEL: &str = "_reliable";

/// Label of the unordered, no-retransmission channel
pub const LOSSY_LABEL: &str = "_lossy";

/// One logical data channel with send/receive counters
pub struct DataChannel {
    label: String,
    lossy: bool,
    inner: Arc<dyn DataChannelHandle>,
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct DataChannelStats {
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
}

impl DataChannel {
    pub fn new(label: &str, lossy: bool, inner: Arc<dyn DataChannelHandle>) -> Self {
        Self {
            label: label.to_string(),
            lossy,
            inner,
            bytes_sent: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_lossy(&self) -> bool {
        self.lossy
    }

    pub async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let len = data.len() as u64;
        self.inner.send(data).await?;
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Install the receive handler; counters are updated before the
    /// handler runs
    pub fn on_message(self: &Arc<Self>, handler: Box<dyn Fn(Bytes) + Send + Sync>) {
        let this = Arc::clone(self);
        self.inner.on_message(Box::new(move |data: Bytes| {
            this.bytes_received
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            this.messages_received.fetch_add(1, Ordering::Relaxed);
            handler(data);
        }));
    }

    pub fn stats(&self) -> DataChannelStats {
        DataChannelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Wire descriptor carried in the resume snapshot
    pub fn descriptor(&self) -> DataChannelDescriptor {
        DataChannelDescriptor {
            label: self.label.clone(),
            lossy: self.lossy,
        }
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
