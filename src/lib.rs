//! peercall - Peer-to-peer calls over relay signaling
//!
//! This library negotiates peer sessions through a broadcast relay and
//! carries text and chunked media payloads over their data channels.

pub mod config;
pub mod network;
pub mod protocol;

pub use config::{CallConfig, ConfigError};
pub use network::{CallEngine, CallEvent, CallHandle, NetworkError};
pub use protocol::{ChannelId, MediaKind, Participant};
