//! roomlink: realtime media session client
//!
//! A client-side session engine for a signaled realtime-media service:
//! a length-prefixed signaling protocol over WebSocket, two independent
//! transport legs (publish and subscribe) negotiated offer/answer with
//! trickled ICE, reliable and lossy data channels, track publication and
//! subscription reconciliation that survives reconnects, and RPC between
//! participants over the reliable channel.
//!
//! The entry point is [`Session::connect`]; everything observable arrives
//! on the event stream it returns.
//!
//! ```no_run
//! use roomlink::{Session, SessionConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (session, mut events) =
//!     Session::connect("wss://media.example.com", "token", SessionConfig::default()).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod proto;
pub mod reconnect;
pub mod rpc;
pub mod session;
pub mod signaling;
pub mod track;
pub mod transport;

pub use config::{SessionConfig, PROTOCOL_VERSION};
pub use error::{
    ConnectError, EngineError, PublishError, Result, RpcError, SignalError, TransportError,
};
pub use events::SessionEvent;
pub use proto::{
    Envelope, IceCandidate, IceServer, LegKind, ParticipantInfo, SimulateScenario, StreamState,
    TrackInfo, TrackKind,
};
pub use reconnect::{DefaultReconnectPolicy, ReconnectContext, ReconnectPolicy};
pub use session::{Session, SessionState};
pub use track::{LocalTrack, TrackId};
