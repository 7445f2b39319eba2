//! Network error types

use thiserror::Error;

use crate::protocol::{ChannelId, ChunkDecodeError};

/// Failures of the offer/answer state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Negotiation already active")]
    AlreadyActive,

    #[error("No active offer")]
    NoActiveOffer,

    #[error("Session description rejected: {0}")]
    DescriptionRejected(String),

    #[error("Session closed")]
    Closed,
}

/// Failures reported by the peer-connection transport primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport failure: {0}")]
    Failed(String),
}

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transport unavailable: no open data channel")]
    TransportUnavailable,

    #[error("Chunk decode error: {0}")]
    ChunkDecode(#[from] ChunkDecodeError),

    #[error("A media transfer is already in flight")]
    TransferInProgress,

    #[error("Relay disconnected")]
    RelayDisconnected,

    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("Channel {0} does not involve the local participant")]
    ForeignChannel(ChannelId),

    #[error("Engine stopped")]
    EngineStopped,
}
