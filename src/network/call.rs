//! Per-channel call session
//!
//! A [`CallSession`] composes one negotiator, one channel pair and one chunk
//! codec. Protocol failures are recovered here: they are logged and reported
//! as [`CallEvent::Warning`] instead of bubbling up.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    ChannelId, ChannelMessage, ChunkedTransferCodec, Decoded, FrameFormat, MediaKind,
    SignalPayload, SignalingEnvelope, DEFAULT_CHUNK_SIZE,
};

use super::data_channel::{ChannelUpdate, DataChannelManager, DEFAULT_CHANNEL_LABEL};
use super::error::NetworkError;
use super::negotiator::{NegotiationState, NegotiatorContext, OfferOutcome, SessionNegotiator};
use super::transport::TransportEvent;

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// The data path to the peer is open
    Connected { channel_id: ChannelId },
    /// Ordinary text message from the peer
    Text { channel_id: ChannelId, text: String },
    /// Reassembled media payload from the peer
    Media {
        channel_id: ChannelId,
        kind: MediaKind,
        payload: Bytes,
    },
    /// The session ended remotely (bye or relay loss)
    Closed { channel_id: ChannelId },
    /// A recoverable protocol problem
    Warning {
        channel_id: Option<ChannelId>,
        message: String,
    },
}

impl CallEvent {
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Self::Connected { channel_id }
            | Self::Text { channel_id, .. }
            | Self::Media { channel_id, .. }
            | Self::Closed { channel_id } => Some(channel_id),
            Self::Warning { channel_id, .. } => channel_id.as_ref(),
        }
    }
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub label: String,
    pub chunk_size: usize,
    pub frame_format: FrameFormat,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_CHANNEL_LABEL.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            frame_format: FrameFormat::default(),
        }
    }
}

/// One call between the local participant and a remote peer
pub struct CallSession {
    channel_id: ChannelId,
    negotiator: SessionNegotiator,
    channels: DataChannelManager,
    codec: ChunkedTransferCodec,
    events: mpsc::UnboundedSender<CallEvent>,
    connected: bool,
    closed_reported: bool,
}

impl CallSession {
    pub fn new(
        channel_id: ChannelId,
        local_user: &str,
        remote_user: &str,
        context: NegotiatorContext,
        options: &SessionOptions,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            negotiator: SessionNegotiator::new(channel_id.clone(), local_user, remote_user, context),
            channels: DataChannelManager::new(options.label.clone()),
            codec: ChunkedTransferCodec::new(options.chunk_size, options.frame_format),
            channel_id,
            events,
            connected: false,
            closed_reported: false,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub fn is_closed(&self) -> bool {
        self.negotiator.state().is_closed()
    }

    /// Whether the data path is open
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.channels.is_open()
    }

    /// Start the caller side; a session already past `Idle` is left alone
    pub async fn connect(&mut self) -> Result<(), NetworkError> {
        if self.negotiator.state() != NegotiationState::Idle {
            debug!(
                "Session {} already {:?}, not initiating",
                self.channel_id,
                self.negotiator.state()
            );
            return Ok(());
        }

        let result = self.start_offer().await;
        if result.is_err() {
            // The caller gets the error; no Closed event for a call that never started
            self.closed_reported = true;
            self.release().await;
        }
        result
    }

    async fn start_offer(&mut self) -> Result<(), NetworkError> {
        let transport = self.negotiator.transport().await?;
        self.channels.open(&transport).await?;
        self.negotiator.initiate().await
    }

    /// Apply one inbound signaling envelope
    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        let kind = envelope.kind();
        trace!("Session {} handling {:?}", self.channel_id, kind);

        let result = match envelope.payload {
            SignalPayload::Offer(offer) => match self.negotiator.on_offer(offer).await {
                Ok(OfferOutcome::Restarted) => {
                    self.channels.clear();
                    self.codec.reset();
                    self.connected = false;
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
            SignalPayload::Answer(answer) => self.negotiator.on_answer(answer).await,
            SignalPayload::Candidate(candidate) => self.negotiator.on_candidate(candidate).await,
            SignalPayload::Ready => self.negotiator.on_ready().map(|_| ()),
            SignalPayload::Bye => {
                self.shutdown().await;
                Ok(())
            }
        };

        if let Err(e) = result {
            self.report(format!("{:?} rejected: {}", kind, e));
        }
        if self.is_closed() {
            self.shutdown().await;
        }
    }

    /// Apply one callback raised by transport `generation`
    pub async fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if !self.negotiator.accepts(generation) {
            trace!(
                "Dropping stale event from generation {} on {}",
                generation,
                self.channel_id
            );
            return;
        }

        if let TransportEvent::CandidateDiscovered(candidate) = event {
            if let Err(e) = self.negotiator.on_local_candidate(candidate) {
                self.report(format!("Failed to forward candidate: {}", e));
            }
            return;
        }

        match self.channels.handle_event(event) {
            ChannelUpdate::Opened => {
                if !self.connected {
                    self.connected = true;
                    info!("Data path open on {}", self.channel_id);
                    self.emit(CallEvent::Connected {
                        channel_id: self.channel_id.clone(),
                    });
                    if let Err(e) = self.negotiator.send_ready() {
                        self.report(format!("Failed to send ready: {}", e));
                    }
                }
            }
            ChannelUpdate::Closed => {
                debug!("Data path down on {}", self.channel_id);
            }
            ChannelUpdate::Message(message) => self.receive(message),
            ChannelUpdate::None => {}
        }
    }

    /// Send a text message to the peer
    pub async fn send_text(&mut self, text: &str) -> Result<(), NetworkError> {
        if self.is_closed() {
            warn!("Session {} closed, dropping text", self.channel_id);
            return Err(NetworkError::TransportUnavailable);
        }
        self.channels
            .send(ChannelMessage::Text(text.to_string()))
            .await
    }

    /// Send a media payload as a chunked transfer.
    ///
    /// Returns the number of binary frames sent.
    pub async fn send_media(&mut self, kind: MediaKind, payload: Bytes) -> Result<usize, NetworkError> {
        if self.is_closed() || !self.channels.is_open() {
            warn!("No open data path on {}, dropping {:?} payload", self.channel_id, kind);
            return Err(NetworkError::TransportUnavailable);
        }
        if !self.codec.begin_transfer(kind) {
            return Err(NetworkError::TransferInProgress);
        }

        let frame_count = self.codec.frame_count(payload.len());
        debug!(
            "Sending {:?} payload of {} bytes in {} frames on {}",
            kind,
            payload.len(),
            frame_count,
            self.channel_id
        );

        let frames = self.codec.encode(kind, payload);
        let result = self.send_frames(frames).await;
        self.codec.finish_transfer();
        result.map(|_| frame_count)
    }

    /// Local hang-up: tell the peer, then release everything silently
    pub async fn close(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.negotiator.send_bye() {
                debug!("Bye for {} not delivered: {}", self.channel_id, e);
            }
            info!("Closed session {}", self.channel_id);
        }
        self.closed_reported = true;
        self.release().await;
    }

    /// Remote hang-up or relay loss: release everything and notify the app once
    pub async fn shutdown(&mut self) {
        self.release().await;
        if !self.closed_reported {
            self.closed_reported = true;
            self.emit(CallEvent::Closed {
                channel_id: self.channel_id.clone(),
            });
        }
    }

    async fn send_frames(&self, frames: impl Iterator<Item = ChannelMessage>) -> Result<(), NetworkError> {
        for frame in frames {
            self.channels.send(frame).await?;
        }
        Ok(())
    }

    async fn release(&mut self) {
        self.connected = false;
        self.negotiator.close().await;
        self.channels.close().await;
        self.codec.reset();
    }

    fn receive(&mut self, message: ChannelMessage) {
        match self.codec.decode(message) {
            Ok(Some(Decoded::Text(text))) => self.emit(CallEvent::Text {
                channel_id: self.channel_id.clone(),
                text,
            }),
            Ok(Some(Decoded::Media { kind, payload })) => {
                info!(
                    "Received {:?} payload of {} bytes on {}",
                    kind,
                    payload.len(),
                    self.channel_id
                );
                self.emit(CallEvent::Media {
                    channel_id: self.channel_id.clone(),
                    kind,
                    payload,
                });
            }
            Ok(None) => {}
            Err(e) => self.report(NetworkError::from(e).to_string()),
        }
    }

    fn report(&self, message: String) {
        warn!("Session {}: {}", self.channel_id, message);
        self.emit(CallEvent::Warning {
            channel_id: Some(self.channel_id.clone()),
            message,
        });
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            trace!("No listener for events on {}", self.channel_id);
        }
    }
}
