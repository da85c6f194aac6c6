//! Session configuration
//!
//! Plain data plus the injected capabilities: reconnect policy, control
//! channel dialer, and peer transport factory. Everything has a production
//! default; tests swap in fakes through the same fields.

use std::sync::Arc;
use std::time::Duration;

use crate::proto::{ClientInfo, IceServer};
use crate::reconnect::{DefaultReconnectPolicy, ReconnectPolicy};
use crate::signaling::stream::{ControlDial, WsDialer};
use crate::transport::capability::PeerTransportFactory;
use crate::transport::rtc::RtcTransportFactory;

/// Protocol version this client speaks
pub const PROTOCOL_VERSION: u32 = 1;

/// Configuration for one session
#[derive(Clone)]
pub struct SessionConfig {
    /// Subscribe to every remote track as it is announced
    pub auto_subscribe: bool,

    /// Bound on the join/resume handshake
    pub join_timeout: Duration,

    /// Bound on waiting for a publish acknowledgment
    pub publish_timeout: Duration,

    /// Client-side ICE servers, merged with the server-provided list
    pub ice_servers: Vec<IceServer>,

    /// Identity reported in the join handshake
    pub client: ClientInfo,

    /// Retry schedule consulted by the session's reconnect coordinator
    pub reconnect_policy: Arc<dyn ReconnectPolicy>,

    /// Control-channel dialer; defaults to WebSocket
    pub dialer: Arc<dyn ControlDial>,

    /// Per-leg transport factory; defaults to the webrtc-backed transport
    pub transport_factory: Arc<dyn PeerTransportFactory>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            join_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            ice_servers: Vec::new(),
            client: ClientInfo::default(),
            reconnect_policy: Arc::new(DefaultReconnectPolicy::default()),
            dialer: Arc::new(WsDialer),
            transport_factory: Arc::new(RtcTransportFactory::default()),
        }
    }
}

impl SessionConfig {
    pub fn with_auto_subscribe(mut self, auto_subscribe: bool) -> Self {
        self.auto_subscribe = auto_subscribe;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn ControlDial>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn PeerTransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }
}
