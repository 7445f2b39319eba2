//! In-process peer transport
//!
//! Two loopback endpoints find each other through the session descriptions
//! they exchange: every description embeds the endpoint id. Once both sides
//! hold a local and a remote description and have applied at least one
//! remote candidate, the offerer's data channels are mirrored on the
//! answerer and both ends report `Open`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::protocol::{ChannelMessage, IceCandidate, SdpType, SessionDescription};

use super::error::TransportError;
use super::transport::{
    ChannelState, DataChannel, PeerTransport, TransportEvent, TransportFactory, TransportSink,
};

const ENDPOINT_ATTRIBUTE: &str = "a=loopback-endpoint:";

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<Uuid, Weak<LoopbackTransport>>>,
    link_lock: Mutex<()>,
    created: AtomicUsize,
}

impl NetworkInner {
    fn endpoint(&self, id: Uuid) -> Option<Arc<LoopbackTransport>> {
        self.endpoints.lock().get(&id).and_then(Weak::upgrade)
    }
}

/// Factory for loopback transports that can reach each other
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transports created so far
    pub fn transports_created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Number of transports that are still open
    pub fn open_transports(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|endpoint| !endpoint.state.lock().closed)
            .count()
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(&self, sink: TransportSink) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(LoopbackTransport {
            id: Uuid::new_v4(),
            sink,
            network: Arc::downgrade(&self.inner),
            state: Mutex::new(EndpointState::default()),
        });

        self.inner
            .endpoints
            .lock()
            .insert(transport.id, Arc::downgrade(&transport));
        self.inner.created.fetch_add(1, Ordering::SeqCst);

        debug!("Created loopback transport {}", transport.id);
        Ok(transport)
    }
}

#[derive(Default)]
struct EndpointState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_endpoint: Option<Uuid>,
    remote_candidates: Vec<IceCandidate>,
    channels: Vec<Arc<LoopbackChannel>>,
    linked: bool,
    closed: bool,
}

impl EndpointState {
    fn ready_to_link(&self) -> bool {
        !self.closed
            && !self.linked
            && self.local.is_some()
            && self.remote.is_some()
            && !self.remote_candidates.is_empty()
    }

    fn is_offerer(&self) -> bool {
        matches!(
            self.local.as_ref().map(|desc| desc.sdp_type),
            Some(SdpType::Offer)
        )
    }
}

/// One side of an in-process peer connection
pub struct LoopbackTransport {
    id: Uuid,
    sink: TransportSink,
    network: Weak<NetworkInner>,
    state: Mutex<EndpointState>,
}

impl LoopbackTransport {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote candidates applied so far, in order
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    fn description(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=loopback {}\r\n{}{}\r\n",
            self.id.as_u128() as u64,
            kind,
            ENDPOINT_ATTRIBUTE,
            self.id
        )
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn try_link(&self) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let _guard = network.link_lock.lock();

        let (ready, peer_id, offerer) = {
            let state = self.state.lock();
            (state.ready_to_link(), state.remote_endpoint, state.is_offerer())
        };
        if !ready {
            return;
        }

        let (Some(this), Some(peer)) = (
            network.endpoint(self.id),
            peer_id.and_then(|id| network.endpoint(id)),
        ) else {
            return;
        };

        {
            let peer_state = peer.state.lock();
            if !peer_state.ready_to_link() || peer_state.remote_endpoint != Some(self.id) {
                return;
            }
        }

        if offerer {
            link(&this, &peer);
        } else {
            link(&peer, &this);
        }
    }
}

/// Mirror the offerer's channels on the answerer and open both ends
fn link(offerer: &Arc<LoopbackTransport>, answerer: &Arc<LoopbackTransport>) {
    let outbound = {
        let mut state = offerer.state.lock();
        state.linked = true;
        state.channels.clone()
    };
    answerer.state.lock().linked = true;

    debug!(
        "Linking loopback {} -> {} ({} channels)",
        offerer.id,
        answerer.id,
        outbound.len()
    );

    for channel in outbound {
        let mirror = Arc::new(LoopbackChannel::new(&channel.label, answerer.sink.clone()));
        *mirror.peer.lock() = Arc::downgrade(&channel);
        *channel.peer.lock() = Arc::downgrade(&mirror);
        mirror.set_state(ChannelState::Open);
        channel.set_state(ChannelState::Open);

        answerer.state.lock().channels.push(mirror.clone());
        answerer
            .sink
            .emit(TransportEvent::IncomingChannel(mirror.clone()));
        answerer.sink.emit(TransportEvent::ChannelStateChanged {
            label: mirror.label.clone(),
            state: ChannelState::Open,
        });
        offerer.sink.emit(TransportEvent::ChannelStateChanged {
            label: channel.label.clone(),
            state: ChannelState::Open,
        });
    }
}

fn endpoint_of(description: &SessionDescription) -> Option<Uuid> {
    description
        .sdp
        .lines()
        .find_map(|line| line.strip_prefix(ENDPOINT_ATTRIBUTE))
        .and_then(|id| Uuid::parse_str(id.trim()).ok())
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.description("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.state.lock().remote.as_ref().map(|desc| desc.sdp_type),
            Some(SdpType::Offer)
        );
        if !has_offer {
            return Err(TransportError::Failed("no remote offer".into()));
        }
        Ok(SessionDescription::answer(self.description("answer")))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().local = Some(description);

        let candidate = IceCandidate::new(
            format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id.as_u128() as u32,
                49152 + (self.id.as_u128() % 16384) as u16
            ),
            Some("0".into()),
            Some(0),
        );
        self.sink
            .emit(TransportEvent::CandidateDiscovered(Some(candidate)));
        self.sink.emit(TransportEvent::CandidateDiscovered(None));

        self.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let remote = endpoint_of(&description)
            .ok_or_else(|| TransportError::Failed("not a loopback description".into()))?;

        {
            let mut state = self.state.lock();
            state.remote = Some(description);
            state.remote_endpoint = Some(remote);
        }

        self.try_link();
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.remote.is_none() {
                return Err(TransportError::Failed("remote description not set".into()));
            }
            trace!("Loopback {} applied candidate {:?}", self.id, candidate.candidate);
            state.remote_candidates.push(candidate);
        }

        self.try_link();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = Arc::new(LoopbackChannel::new(label, self.sink.clone()));
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.channels.push(channel.clone());
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channels = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.channels)
        };

        for channel in channels {
            channel.shutdown();
        }

        if let Some(network) = self.network.upgrade() {
            network.endpoints.lock().remove(&self.id);
        }

        debug!("Closed loopback transport {}", self.id);
        Ok(())
    }
}

/// A loopback data channel; messages are delivered to the mirrored end
pub struct LoopbackChannel {
    label: String,
    state: Mutex<ChannelState>,
    sink: TransportSink,
    peer: Mutex<Weak<LoopbackChannel>>,
}

impl LoopbackChannel {
    fn new(label: &str, sink: TransportSink) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            sink,
            peer: Mutex::new(Weak::new()),
        }
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    fn deliver(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if !self.state.lock().is_open() {
            return Err(TransportError::Closed);
        }
        self.sink.emit(TransportEvent::ChannelMessage {
            label: self.label.clone(),
            message,
        });
        Ok(())
    }

    fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if !self.state.lock().is_open() {
            return Err(TransportError::Closed);
        }
        let peer = self.peer.lock().upgrade().ok_or(TransportError::Closed)?;
        peer.deliver(message)
    }

    /// Close this end and tell the mirrored end
    fn shutdown(&self) {
        self.set_state(ChannelState::Closed);
        if let Some(peer) = self.peer.lock().upgrade() {
            let was_open = {
                let mut state = peer.state.lock();
                let was_open = *state != ChannelState::Closed;
                *state = ChannelState::Closed;
                was_open
            };
            if was_open {
                peer.sink.emit(TransportEvent::ChannelStateChanged {
                    label: peer.label.clone(),
                    state: ChannelState::Closed,
                });
            }
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(ChannelMessage::Text(text.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.send(ChannelMessage::Binary(data))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        self.sink.emit(TransportEvent::ChannelStateChanged {
            label: self.label.clone(),
            state: ChannelState::Closed,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::network::transport::SessionEvent;
    use crate::protocol::ChannelId;

    async fn endpoint(
        network: &LoopbackNetwork,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = TransportSink::new(ChannelId::from_raw("c1"), 0, tx);
        (network.create(sink).await.unwrap(), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.event);
        }
        events
    }

    fn local_candidate(events: &[TransportEvent]) -> IceCandidate {
        events
            .iter()
            .find_map(|event| match event {
                TransportEvent::CandidateDiscovered(Some(candidate)) => Some(candidate.clone()),
                _ => None,
            })
            .expect("No candidate discovered")
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_fails() {
        let network = LoopbackNetwork::new();
        let (transport, _rx) = endpoint(&network).await;
        let result = transport.add_candidate(IceCandidate::default()).await;
        assert!(matches!(result, Err(TransportError::Failed(_))));
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let network = LoopbackNetwork::new();
        let (transport, _rx) = endpoint(&network).await;
        assert!(transport.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_description_is_rejected() {
        let network = LoopbackNetwork::new();
        let (transport, _rx) = endpoint(&network).await;
        let result = transport
            .set_remote_description(SessionDescription::offer("v=0"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_full_exchange_opens_channels() {
        let network = LoopbackNetwork::new();
        let (caller, mut caller_rx) = endpoint(&network).await;
        let (callee, mut callee_rx) = endpoint(&network).await;

        let outbound = caller.create_data_channel("chat").await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(offer.clone()).await.unwrap();

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        let caller_candidate = local_candidate(&drain(&mut caller_rx));
        let callee_candidate = local_candidate(&drain(&mut callee_rx));
        callee.add_candidate(caller_candidate).await.unwrap();
        assert_eq!(outbound.state(), ChannelState::Connecting);
        caller.add_candidate(callee_candidate).await.unwrap();

        assert_eq!(outbound.state(), ChannelState::Open);
        let incoming = drain(&mut callee_rx)
            .into_iter()
            .find_map(|event| match event {
                TransportEvent::IncomingChannel(channel) => Some(channel),
                _ => None,
            })
            .expect("No incoming channel");
        assert_eq!(incoming.label(), "chat");
        assert!(incoming.state().is_open());

        outbound.send_text("hi").await.unwrap();
        incoming.send_binary(Bytes::from_static(b"yo")).await.unwrap();

        let at_callee = drain(&mut callee_rx);
        assert!(matches!(
            &at_callee[..],
            [TransportEvent::ChannelMessage { message: ChannelMessage::Text(text), .. }] if text == "hi"
        ));
        let at_caller = drain(&mut caller_rx);
        assert!(at_caller.iter().any(|event| matches!(
            event,
            TransportEvent::ChannelMessage { message: ChannelMessage::Binary(data), .. } if data.as_ref() == b"yo"
        )));

        caller.close().await.unwrap();
        assert_eq!(incoming.state(), ChannelState::Closed);
        assert!(incoming.send_text("late").await.is_err());
        assert_eq!(network.transports_created(), 2);
        assert_eq!(network.open_transports(), 1);
    }
}
