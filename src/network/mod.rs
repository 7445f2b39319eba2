//! Network module for peer calls
//!
//! Handles relay signaling, offer/answer negotiation, data channels and the
//! session registry driven by the call engine.

mod call;
mod data_channel;
mod engine;
mod error;
mod loopback;
mod negotiator;
mod registry;
#[cfg(feature = "webrtc-rs")]
mod rtc;
mod signaling;
mod transport;

pub use call::{CallEvent, CallSession, SessionOptions};
pub use data_channel::{ChannelUpdate, DataChannelManager, DEFAULT_CHANNEL_LABEL};
pub use engine::{CallEngine, CallHandle};
pub use error::{NegotiationError, NetworkError, TransportError};
pub use loopback::{LoopbackChannel, LoopbackNetwork, LoopbackTransport};
pub use negotiator::{
    GenerationCounter, NegotiationState, NegotiatorContext, OfferOutcome, SessionNegotiator,
};
pub use registry::{SessionRegistry, SessionStatus};
#[cfg(feature = "webrtc-rs")]
pub use rtc::{RtcChannel, RtcTransport, RtcTransportFactory, DEFAULT_ICE_SERVER};
pub use signaling::{
    MemoryRelay, RelayClient, RelayConnection, RelayEvent, RelayHandle, RelayInbound, RelayServer,
    SignalingChannel, RELAY_BACKLOG,
};
pub use transport::{
    ChannelState, DataChannel, PeerTransport, SessionEvent, TransportEvent, TransportFactory,
    TransportSink,
};
