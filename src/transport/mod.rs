//! Transport layer: dual peer legs, data channels, and the engine that
//! coordinates them

pub mod capability;
pub mod data_channel;
pub mod engine;
pub mod leg;
pub mod rtc;

pub use capability::{
    DataChannelHandle, LegConnectionState, PeerTransport, PeerTransportFactory, SdpKind,
};
pub use data_channel::{DataChannel, DataChannelStats, LOSSY_LABEL, RELIABLE_LABEL};
pub use engine::{EngineEvent, TransportEngine};
pub use leg::TransportLeg;
pub use rtc::{RtcPeerTransport, RtcTransportFactory};
