//! Send/receive channel pair of one session
//!
//! The caller creates the outbound channel before its offer; the callee's
//! channel arrives later as [`TransportEvent::IncomingChannel`]. Sends go to
//! whichever of the two is open, outbound first.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::protocol::ChannelMessage;

use super::error::NetworkError;
use super::transport::{ChannelState, DataChannel, PeerTransport, TransportEvent};

/// Label of the session data channel
pub const DEFAULT_CHANNEL_LABEL: &str = "peercall";

/// What a transport event meant for the channel pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelUpdate {
    /// A channel became usable and none was before
    Opened,
    /// The last usable channel went away
    Closed,
    /// Inbound message on one of the channels
    Message(ChannelMessage),
    /// Nothing for the session to act on
    None,
}

/// Owns the outbound and inbound data channels
pub struct DataChannelManager {
    label: String,
    outbound: Option<Arc<dyn DataChannel>>,
    inbound: Option<Arc<dyn DataChannel>>,
    states: HashMap<String, ChannelState>,
    /// Open state last reported through [`ChannelUpdate`]
    reported_open: bool,
}

impl DataChannelManager {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            outbound: None,
            inbound: None,
            states: HashMap::new(),
            reported_open: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Create the outbound channel on `transport`
    pub async fn open(&mut self, transport: &Arc<dyn PeerTransport>) -> Result<(), NetworkError> {
        if self.outbound.is_some() {
            return Ok(());
        }
        let channel = transport.create_data_channel(&self.label).await?;
        debug!("Created outbound channel '{}'", self.label);
        self.states
            .insert(channel.label().to_string(), channel.state());
        self.outbound = Some(channel);
        Ok(())
    }

    /// Whether any channel can carry a message right now
    pub fn is_open(&self) -> bool {
        self.active().is_some()
    }

    /// Last observed state per channel label
    pub fn channel_state(&self, label: &str) -> Option<ChannelState> {
        self.states.get(label).copied()
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn has_inbound(&self) -> bool {
        self.inbound.is_some()
    }

    /// Fold one transport event into the channel pair
    pub fn handle_event(&mut self, event: TransportEvent) -> ChannelUpdate {
        match event {
            TransportEvent::IncomingChannel(channel) => {
                debug!("Incoming channel '{}'", channel.label());
                self.states
                    .insert(channel.label().to_string(), channel.state());
                self.inbound = Some(channel);
                self.transition()
            }
            TransportEvent::ChannelStateChanged { label, state } => {
                let previous = self.states.insert(label.clone(), state);
                debug!(
                    "Channel '{}' {:?} -> {:?}",
                    label,
                    previous.unwrap_or_default(),
                    state
                );
                self.transition()
            }
            TransportEvent::ChannelMessage { label, message } => {
                trace!("Channel '{}' received {} bytes", label, message.len());
                ChannelUpdate::Message(message)
            }
            TransportEvent::CandidateDiscovered(_) => ChannelUpdate::None,
        }
    }

    /// Send on the outbound channel if open, else on the inbound one
    pub async fn send(&self, message: ChannelMessage) -> Result<(), NetworkError> {
        let Some(channel) = self.active() else {
            warn!(
                "No open channel for '{}', dropping {} byte message",
                self.label,
                message.len()
            );
            return Err(NetworkError::TransportUnavailable);
        };

        match message {
            ChannelMessage::Text(text) => channel.send_text(&text).await?,
            ChannelMessage::Binary(data) => channel.send_binary(data).await?,
        }
        Ok(())
    }

    /// Forget both channels without closing them (their transport is gone)
    pub fn clear(&mut self) {
        self.outbound = None;
        self.inbound = None;
        self.states.clear();
        self.reported_open = false;
    }

    /// Close both channels
    pub async fn close(&mut self) {
        for channel in [self.outbound.take(), self.inbound.take()].into_iter().flatten() {
            if let Err(e) = channel.close().await {
                debug!("Closing channel '{}': {}", channel.label(), e);
            }
        }
        self.states.clear();
        self.reported_open = false;
    }

    fn active(&self) -> Option<&Arc<dyn DataChannel>> {
        [&self.outbound, &self.inbound]
            .into_iter()
            .flatten()
            .find(|channel| channel.state().is_open())
    }

    /// Edge between the last reported open state and the live one.
    /// The live state may already be ahead of the event being handled.
    fn transition(&mut self) -> ChannelUpdate {
        let open = self.is_open();
        let update = match (self.reported_open, open) {
            (false, true) => ChannelUpdate::Opened,
            (true, false) => ChannelUpdate::Closed,
            _ => ChannelUpdate::None,
        };
        self.reported_open = open;
        update
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::network::error::TransportError;
    use crate::protocol::{IceCandidate, SessionDescription};

    struct FakeChannel {
        label: String,
        state: Mutex<ChannelState>,
        sent: Mutex<Vec<ChannelMessage>>,
    }

    impl FakeChannel {
        fn new(label: &str, state: ChannelState) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                state: Mutex::new(state),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DataChannel for FakeChannel {
        fn label(&self) -> &str {
            &self.label
        }

        fn state(&self) -> ChannelState {
            *self.state.lock()
        }

        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            self.sent.lock().push(ChannelMessage::Text(text.to_string()));
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
            self.sent.lock().push(ChannelMessage::Binary(data));
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            *self.state.lock() = ChannelState::Closed;
            Ok(())
        }
    }

    struct ChannelFactory(Arc<FakeChannel>);

    #[async_trait]
    impl PeerTransport for ChannelFactory {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::offer(""))
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::answer(""))
        }

        async fn set_local_description(&self, _: SessionDescription) -> Result<(), TransportError> {
            Ok(())
        }

        async fn set_remote_description(&self, _: SessionDescription) -> Result<(), TransportError> {
            Ok(())
        }

        async fn add_candidate(&self, _: IceCandidate) -> Result<(), TransportError> {
            Ok(())
        }

        async fn create_data_channel(
            &self,
            _: &str,
        ) -> Result<Arc<dyn DataChannel>, TransportError> {
            Ok(self.0.clone())
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_without_channel_is_unavailable() {
        let manager = DataChannelManager::new("c");
        let err = manager
            .send(ChannelMessage::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::TransportUnavailable));
    }

    #[tokio::test]
    async fn test_outbound_preferred_when_open() {
        let outbound = FakeChannel::new("c", ChannelState::Connecting);
        let inbound = FakeChannel::new("c", ChannelState::Open);
        let transport: Arc<dyn PeerTransport> = Arc::new(ChannelFactory(outbound.clone()));

        let mut manager = DataChannelManager::new("c");
        manager.open(&transport).await.unwrap();
        assert_eq!(
            manager.handle_event(TransportEvent::IncomingChannel(inbound.clone())),
            ChannelUpdate::Opened
        );

        // Outbound still connecting: falls back to inbound
        manager.send(ChannelMessage::Text("a".into())).await.unwrap();
        assert_eq!(inbound.sent.lock().len(), 1);

        *outbound.state.lock() = ChannelState::Open;
        manager.send(ChannelMessage::Text("b".into())).await.unwrap();
        assert_eq!(outbound.sent.lock().len(), 1);
        assert_eq!(inbound.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_state_changes_report_open_and_close() {
        let outbound = FakeChannel::new("c", ChannelState::Connecting);
        let transport: Arc<dyn PeerTransport> = Arc::new(ChannelFactory(outbound.clone()));
        let mut manager = DataChannelManager::new("c");
        manager.open(&transport).await.unwrap();
        assert_eq!(manager.channel_state("c"), Some(ChannelState::Connecting));

        *outbound.state.lock() = ChannelState::Open;
        let update = manager.handle_event(TransportEvent::ChannelStateChanged {
            label: "c".into(),
            state: ChannelState::Open,
        });
        assert_eq!(update, ChannelUpdate::Opened);
        assert!(manager.is_open());

        *outbound.state.lock() = ChannelState::Closed;
        let update = manager.handle_event(TransportEvent::ChannelStateChanged {
            label: "c".into(),
            state: ChannelState::Closed,
        });
        assert_eq!(update, ChannelUpdate::Closed);
        assert_eq!(manager.channel_state("c"), Some(ChannelState::Closed));
    }

    #[tokio::test]
    async fn test_open_reported_once_when_state_flips_before_event() {
        let outbound = FakeChannel::new("c", ChannelState::Connecting);
        let inbound = FakeChannel::new("c", ChannelState::Open);
        let transport: Arc<dyn PeerTransport> = Arc::new(ChannelFactory(outbound.clone()));
        let mut manager = DataChannelManager::new("c");
        manager.open(&transport).await.unwrap();

        // The channel is already open by the time its callback is handled
        *outbound.state.lock() = ChannelState::Open;
        assert!(manager.is_open());
        let update = manager.handle_event(TransportEvent::ChannelStateChanged {
            label: "c".into(),
            state: ChannelState::Open,
        });
        assert_eq!(update, ChannelUpdate::Opened);

        // A second open channel is not a new edge
        assert_eq!(
            manager.handle_event(TransportEvent::IncomingChannel(inbound)),
            ChannelUpdate::None
        );
        assert_eq!(
            manager.handle_event(TransportEvent::ChannelStateChanged {
                label: "c".into(),
                state: ChannelState::Open,
            }),
            ChannelUpdate::None
        );
    }

    #[tokio::test]
    async fn test_clear_rearms_open_report() {
        let inbound = FakeChannel::new("c", ChannelState::Open);
        let mut manager = DataChannelManager::new("c");
        assert_eq!(
            manager.handle_event(TransportEvent::IncomingChannel(inbound.clone())),
            ChannelUpdate::Opened
        );

        manager.clear();
        assert_eq!(
            manager.handle_event(TransportEvent::IncomingChannel(inbound)),
            ChannelUpdate::Opened
        );
    }

    #[test]
    fn test_messages_pass_through() {
        let mut manager = DataChannelManager::new("c");
        let update = manager.handle_event(TransportEvent::ChannelMessage {
            label: "c".into(),
            message: ChannelMessage::Binary(Bytes::from_static(b"xy")),
        });
        assert_eq!(
            update,
            ChannelUpdate::Message(ChannelMessage::Binary(Bytes::from_static(b"xy")))
        );
        assert_eq!(
            manager.handle_event(TransportEvent::CandidateDiscovered(None)),
            ChannelUpdate::None
        );
    }

    #[tokio::test]
    async fn test_close_releases_channels() {
        let inbound = FakeChannel::new("c", ChannelState::Open);
        let mut manager = DataChannelManager::new("c");
        manager.handle_event(TransportEvent::IncomingChannel(inbound.clone()));

        manager.close().await;

        assert!(!manager.is_open());
        assert!(!manager.has_inbound());
        assert_eq!(inbound.state(), ChannelState::Closed);
    }
}
