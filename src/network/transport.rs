//! Peer-connection transport capability
//!
//! The core never implements session-description negotiation, candidate
//! transport or data channel I/O itself. It drives an implementation of
//! [`PeerTransport`] and receives its asynchronous callbacks as
//! [`TransportEvent`]s through a [`TransportSink`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::{ChannelId, ChannelMessage, IceCandidate, SessionDescription};

use super::error::TransportError;

/// Data channel ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// One peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Create an outbound data channel (must happen before the offer)
    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Release the connection and all of its channels
    async fn close(&self) -> Result<(), TransportError>;
}

/// A message channel on top of a peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds a fresh transport per negotiation attempt
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, sink: TransportSink) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Callbacks raised by a transport
pub enum TransportEvent {
    /// Local candidate found; `None` marks the end of gathering
    CandidateDiscovered(Option<IceCandidate>),
    /// The remote side opened a channel
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelStateChanged { label: String, state: ChannelState },
    ChannelMessage { label: String, message: ChannelMessage },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CandidateDiscovered(candidate) => {
                f.debug_tuple("CandidateDiscovered").field(candidate).finish()
            }
            Self::IncomingChannel(channel) => {
                f.debug_tuple("IncomingChannel").field(&channel.label()).finish()
            }
            Self::ChannelStateChanged { label, state } => f
                .debug_struct("ChannelStateChanged")
                .field("label", label)
                .field("state", state)
                .finish(),
            Self::ChannelMessage { label, message } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("len", &message.len())
                .finish(),
        }
    }
}

/// A transport event tagged with its owner
#[derive(Debug)]
pub struct SessionEvent {
    pub channel_id: ChannelId,
    /// Transport generation that raised the event
    pub generation: u64,
    pub event: TransportEvent,
}

/// Delivers transport callbacks into the session event loop
#[derive(Debug, Clone)]
pub struct TransportSink {
    channel_id: ChannelId,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl TransportSink {
    pub fn new(
        channel_id: ChannelId,
        generation: u64,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            channel_id,
            generation,
            tx,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        let event = SessionEvent {
            channel_id: self.channel_id.clone(),
            generation: self.generation,
            event,
        };
        if self.tx.send(event).is_err() {
            trace!("Event loop gone, dropping transport event for {}", self.channel_id);
        }
    }
}
