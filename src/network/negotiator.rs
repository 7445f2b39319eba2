//! Offer/answer negotiation for one peer session
//!
//! ```text
//! [*] --> Idle
//! Idle --> OfferSent: initiate()
//! Idle --> OfferReceived: on_offer()
//! OfferSent --> OfferReceived: on_offer() and the remote id wins the glare
//! OfferReceived --> Answering: remote description applied
//! Answering --> Connected: local answer applied and sent
//! OfferSent --> Connected: on_answer()
//! * --> Closed: on_bye() / close()
//! ```
//!
//! Remote candidates that arrive before the remote description is applied
//! are queued and flushed in arrival order right after it is.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::protocol::{ChannelId, IceCandidate, SessionDescription, SignalingEnvelope};

use super::error::{NegotiationError, NetworkError};
use super::signaling::SignalingChannel;
use super::transport::{PeerTransport, SessionEvent, TransportFactory, TransportSink};

/// Source of transport generations, shared by every session of a registry
pub type GenerationCounter = Arc<AtomicU64>;

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    OfferSent,
    OfferReceived,
    Answering,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// What happened to an inbound offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The offer was answered
    Answered,
    /// Our pending offer lost the glare tie-break; it was discarded and the
    /// remote offer answered on a fresh transport
    Restarted,
    /// Our pending offer won the glare tie-break; the remote offer was ignored
    Ignored,
}

/// Everything a negotiator needs from its owner
#[derive(Clone)]
pub struct NegotiatorContext {
    pub signaling: SignalingChannel,
    pub factory: Arc<dyn TransportFactory>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub generations: GenerationCounter,
}

/// Drives the offer/answer/candidate exchange for one channel
pub struct SessionNegotiator {
    channel_id: ChannelId,
    local_user: String,
    remote_user: String,
    state: NegotiationState,
    context: NegotiatorContext,
    transport: Option<Arc<dyn PeerTransport>>,
    generation: u64,
    local_description: Option<SessionDescription>,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

impl SessionNegotiator {
    pub fn new(
        channel_id: ChannelId,
        local_user: impl Into<String>,
        remote_user: impl Into<String>,
        context: NegotiatorContext,
    ) -> Self {
        Self {
            channel_id,
            local_user: local_user.into(),
            remote_user: remote_user.into(),
            state: NegotiationState::Idle,
            context,
            transport: None,
            generation: 0,
            local_description: None,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Generation of the live transport (0 when none was created yet)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an event raised by transport `generation` still applies
    pub fn accepts(&self, generation: u64) -> bool {
        !self.state.is_closed() && self.transport.is_some() && generation == self.generation
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Remote candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Whether the local side wins an offer collision
    pub fn wins_glare(&self) -> bool {
        self.local_user < self.remote_user
    }

    /// The live transport, created on first use
    pub async fn transport(&mut self) -> Result<Arc<dyn PeerTransport>, NetworkError> {
        if self.state.is_closed() {
            return Err(NegotiationError::Closed.into());
        }
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }

        let generation = self.context.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = TransportSink::new(self.channel_id.clone(), generation, self.context.events.clone());
        let transport = self.context.factory.create(sink).await?;

        debug!("Transport generation {} for {}", generation, self.channel_id);
        self.generation = generation;
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    /// Caller side: create and send an offer
    pub async fn initiate(&mut self) -> Result<(), NetworkError> {
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::AlreadyActive.into());
        }

        if let Err(e) = self.send_offer().await {
            warn!("Offer on {} failed: {}", self.channel_id, e);
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// `OfferSent` is only entered once the offer is on the relay
    async fn send_offer(&mut self) -> Result<(), NetworkError> {
        let transport = self.transport().await?;
        let offer = transport.create_offer().await?;
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::DescriptionRejected(e.to_string()))?;

        info!("Sending offer on {}", self.channel_id);
        self.context
            .signaling
            .send(SignalingEnvelope::offer(self.channel_id.clone(), offer.clone()))?;
        self.local_description = Some(offer);
        self.state = NegotiationState::OfferSent;
        Ok(())
    }

    /// Callee side: apply a remote offer and answer it
    pub async fn on_offer(&mut self, offer: SessionDescription) -> Result<OfferOutcome, NetworkError> {
        let restarted = match self.state {
            NegotiationState::Idle => false,
            NegotiationState::OfferSent => {
                if self.wins_glare() {
                    info!(
                        "Offer collision on {}: keeping local offer ({} < {})",
                        self.channel_id, self.local_user, self.remote_user
                    );
                    return Ok(OfferOutcome::Ignored);
                }
                info!(
                    "Offer collision on {}: discarding local offer for {}",
                    self.channel_id, self.remote_user
                );
                self.reset_transport().await;
                true
            }
            NegotiationState::Closed => return Err(NegotiationError::Closed.into()),
            _ => return Err(NegotiationError::AlreadyActive.into()),
        };

        self.state = NegotiationState::OfferReceived;
        let transport = self.transport().await?;

        if let Err(e) = transport.set_remote_description(offer).await {
            warn!("Remote offer rejected on {}: {}", self.channel_id, e);
            self.close().await;
            return Err(NegotiationError::DescriptionRejected(e.to_string()).into());
        }
        self.remote_description_set = true;
        self.flush_candidates(&transport).await;

        self.state = NegotiationState::Answering;
        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.close().await;
                return Err(e.into());
            }
        };
        if let Err(e) = transport.set_local_description(answer.clone()).await {
            self.close().await;
            return Err(NegotiationError::DescriptionRejected(e.to_string()).into());
        }
        info!("Answering offer on {}", self.channel_id);
        if let Err(e) = self
            .context
            .signaling
            .send(SignalingEnvelope::answer(self.channel_id.clone(), answer.clone()))
        {
            warn!("Answer on {} not sent: {}", self.channel_id, e);
            self.close().await;
            return Err(e);
        }
        self.local_description = Some(answer);
        self.state = NegotiationState::Connected;

        Ok(if restarted {
            OfferOutcome::Restarted
        } else {
            OfferOutcome::Answered
        })
    }

    /// Caller side: apply the remote answer
    pub async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NetworkError> {
        if self.state != NegotiationState::OfferSent {
            return Err(NegotiationError::NoActiveOffer.into());
        }
        let transport = self
            .transport
            .clone()
            .ok_or(NegotiationError::NoActiveOffer)?;

        transport
            .set_remote_description(answer)
            .await
            .map_err(|e| NegotiationError::DescriptionRejected(e.to_string()))?;
        self.remote_description_set = true;
        self.flush_candidates(&transport).await;

        self.state = NegotiationState::Connected;
        info!("Answer applied on {}", self.channel_id);
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    pub async fn on_candidate(&mut self, candidate: IceCandidate) -> Result<(), NetworkError> {
        if self.state.is_closed() {
            return Err(NegotiationError::Closed.into());
        }
        if candidate.candidate.as_deref().map_or(true, str::is_empty) {
            trace!("End of remote candidates on {}", self.channel_id);
            return Ok(());
        }

        match (&self.transport, self.remote_description_set) {
            (Some(transport), true) => {
                let transport = transport.clone();
                transport.add_candidate(candidate).await?;
                Ok(())
            }
            _ => {
                trace!(
                    "Queueing candidate on {} ({} pending)",
                    self.channel_id,
                    self.pending_candidates.len() + 1
                );
                self.pending_candidates.push_back(candidate);
                Ok(())
            }
        }
    }

    /// Forward a locally discovered candidate to the remote peer
    pub fn on_local_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), NetworkError> {
        match candidate {
            Some(candidate) if !self.state.is_closed() => self
                .context
                .signaling
                .send(SignalingEnvelope::candidate(self.channel_id.clone(), candidate)),
            Some(_) => Ok(()),
            None => {
                trace!("Local candidate gathering complete on {}", self.channel_id);
                Ok(())
            }
        }
    }

    /// Tell the remote side our data path is up
    pub fn send_ready(&self) -> Result<(), NetworkError> {
        if self.state.is_closed() {
            return Err(NegotiationError::Closed.into());
        }
        self.context
            .signaling
            .send(SignalingEnvelope::ready(self.channel_id.clone()))
    }

    /// Tell the remote side we are leaving
    pub fn send_bye(&self) -> Result<(), NetworkError> {
        self.context
            .signaling
            .send(SignalingEnvelope::bye(self.channel_id.clone()))
    }

    /// The remote side reports its data path is up
    pub fn on_ready(&mut self) -> Result<NegotiationState, NetworkError> {
        match self.state {
            NegotiationState::Closed => return Err(NegotiationError::Closed.into()),
            NegotiationState::OfferReceived | NegotiationState::Answering
                if self.remote_description_set =>
            {
                self.state = NegotiationState::Connected;
            }
            NegotiationState::Connected => {}
            other => debug!("Ready on {} ignored in {:?}", self.channel_id, other),
        }
        Ok(self.state)
    }

    /// The remote side hung up
    pub async fn on_bye(&mut self) {
        info!("Peer left {}", self.channel_id);
        self.close().await;
    }

    /// Release the transport and discard queued candidates
    pub async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        self.local_description = None;
        self.remote_description_set = false;
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Failed to close transport for {}: {}", self.channel_id, e);
            }
        }
    }

    async fn flush_candidates(&mut self, transport: &Arc<dyn PeerTransport>) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            "Flushing {} queued candidates on {}",
            self.pending_candidates.len(),
            self.channel_id
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = transport.add_candidate(candidate).await {
                warn!("Queued candidate rejected on {}: {}", self.channel_id, e);
            }
        }
    }

    /// Drop the current transport but keep queued remote candidates
    async fn reset_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Failed to close transport for {}: {}", self.channel_id, e);
            }
        }
        self.local_description = None;
        self.remote_description_set = false;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::network::error::TransportError;
    use crate::network::transport::DataChannel;
    use crate::protocol::{SignalKind, SignalPayload};

    /// Records every call; fails `add_candidate` before a remote description
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        applied: Mutex<Vec<IceCandidate>>,
        remote_set: Mutex<bool>,
        reject_remote: bool,
        created: Mutex<usize>,
        closed: Mutex<usize>,
    }

    struct RecordingTransport(Arc<Recorder>);

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            self.0.calls.lock().push("create_offer".into());
            Ok(SessionDescription::offer("offer-sdp"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            self.0.calls.lock().push("create_answer".into());
            Ok(SessionDescription::answer("answer-sdp"))
        }

        async fn set_local_description(&self, _: SessionDescription) -> Result<(), TransportError> {
            self.0.calls.lock().push("set_local".into());
            Ok(())
        }

        async fn set_remote_description(&self, _: SessionDescription) -> Result<(), TransportError> {
            self.0.calls.lock().push("set_remote".into());
            if self.0.reject_remote {
                return Err(TransportError::Failed("bad sdp".into()));
            }
            *self.0.remote_set.lock() = true;
            Ok(())
        }

        async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
            if !*self.0.remote_set.lock() {
                return Err(TransportError::Failed("no remote description".into()));
            }
            self.0.applied.lock().push(candidate);
            Ok(())
        }

        async fn create_data_channel(
            &self,
            _: &str,
        ) -> Result<Arc<dyn DataChannel>, TransportError> {
            Err(TransportError::Failed("unsupported".into()))
        }

        async fn close(&self) -> Result<(), TransportError> {
            *self.0.closed.lock() += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl TransportFactory for Arc<Recorder> {
        async fn create(&self, _: TransportSink) -> Result<Arc<dyn PeerTransport>, TransportError> {
            *self.created.lock() += 1;
            *self.remote_set.lock() = false;
            Ok(Arc::new(RecordingTransport(self.clone())))
        }
    }

    fn negotiator(
        local: &str,
        remote: &str,
        recorder: Arc<Recorder>,
    ) -> (SessionNegotiator, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events, _) = mpsc::unbounded_channel();
        let context = NegotiatorContext {
            signaling: SignalingChannel::new(signal_tx),
            factory: Arc::new(recorder),
            events,
            generations: Arc::new(AtomicU64::new(0)),
        };
        let channel = ChannelId::for_pair("t", local, remote);
        (SessionNegotiator::new(channel, local, remote, context), signal_rx)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{}", n), Some("0".into()), Some(0))
    }

    fn kinds(rx: &mut mpsc::UnboundedReceiver<SignalingEnvelope>) -> Vec<SignalKind> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope.kind());
        }
        out
    }

    #[tokio::test]
    async fn test_initiate_sends_offer() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, mut rx) = negotiator("1", "2", recorder.clone());

        neg.initiate().await.unwrap();

        assert_eq!(neg.state(), NegotiationState::OfferSent);
        assert_eq!(kinds(&mut rx), vec![SignalKind::Offer]);
        assert_eq!(*recorder.calls.lock(), vec!["create_offer", "set_local"]);
        assert!(neg.local_description().is_some());
    }

    #[tokio::test]
    async fn test_offer_not_delivered_closes() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, rx) = negotiator("1", "2", recorder.clone());
        drop(rx);

        let err = neg.initiate().await.unwrap_err();

        assert!(matches!(err, NetworkError::RelayDisconnected));
        assert_eq!(neg.state(), NegotiationState::Closed);
        assert!(neg.local_description().is_none());
        assert_eq!(*recorder.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_answer_not_delivered_closes() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, rx) = negotiator("2", "1", recorder.clone());
        drop(rx);

        let err = neg.on_offer(SessionDescription::offer("x")).await.unwrap_err();

        assert!(matches!(err, NetworkError::RelayDisconnected));
        assert_eq!(neg.state(), NegotiationState::Closed);
        assert_eq!(*recorder.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_initiate_twice_is_already_active() {
        let (mut neg, mut rx) = negotiator("1", "2", Arc::new(Recorder::default()));
        neg.initiate().await.unwrap();

        let err = neg.initiate().await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Negotiation(NegotiationError::AlreadyActive)
        ));
        assert_eq!(kinds(&mut rx), vec![SignalKind::Offer]);
    }

    #[tokio::test]
    async fn test_on_offer_answers() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, mut rx) = negotiator("2", "1", recorder.clone());

        let outcome = neg.on_offer(SessionDescription::offer("x")).await.unwrap();

        assert_eq!(outcome, OfferOutcome::Answered);
        assert_eq!(neg.state(), NegotiationState::Connected);
        assert_eq!(kinds(&mut rx), vec![SignalKind::Answer]);
        assert_eq!(
            *recorder.calls.lock(),
            vec!["set_remote", "create_answer", "set_local"]
        );
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_reported() {
        let (mut neg, _rx) = negotiator("1", "2", Arc::new(Recorder::default()));
        let err = neg
            .on_answer(SessionDescription::answer("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Negotiation(NegotiationError::NoActiveOffer)
        ));
        assert_eq!(neg.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_early_candidates_flush_in_order_exactly_once() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, _rx) = negotiator("1", "2", recorder.clone());

        neg.initiate().await.unwrap();
        for n in 0..5 {
            neg.on_candidate(candidate(n)).await.unwrap();
        }
        assert_eq!(neg.pending_candidates(), 5);
        assert!(recorder.applied.lock().is_empty());

        neg.on_answer(SessionDescription::answer("x")).await.unwrap();
        assert_eq!(neg.pending_candidates(), 0);
        assert_eq!(
            *recorder.applied.lock(),
            (0..5).map(candidate).collect::<Vec<_>>()
        );

        // Later candidates are applied directly
        neg.on_candidate(candidate(5)).await.unwrap();
        assert_eq!(recorder.applied.lock().len(), 6);
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_kept_for_callee() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, _rx) = negotiator("2", "1", recorder.clone());

        neg.on_candidate(candidate(1)).await.unwrap();
        neg.on_candidate(candidate(2)).await.unwrap();
        neg.on_offer(SessionDescription::offer("x")).await.unwrap();

        assert_eq!(*recorder.applied.lock(), vec![candidate(1), candidate(2)]);
    }

    #[tokio::test]
    async fn test_end_of_candidates_is_ignored() {
        let (mut neg, _rx) = negotiator("1", "2", Arc::new(Recorder::default()));
        neg.on_candidate(IceCandidate::default()).await.unwrap();
        assert_eq!(neg.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded_end_marker_not_sent() {
        let (neg, mut rx) = negotiator("1", "2", Arc::new(Recorder::default()));
        neg.on_local_candidate(Some(candidate(1))).unwrap();
        neg.on_local_candidate(None).unwrap();

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.payload, SignalPayload::Candidate(candidate(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_glare_smaller_id_keeps_offer() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, mut rx) = negotiator("alice", "bob", recorder.clone());
        neg.initiate().await.unwrap();

        let outcome = neg.on_offer(SessionDescription::offer("x")).await.unwrap();

        assert_eq!(outcome, OfferOutcome::Ignored);
        assert_eq!(neg.state(), NegotiationState::OfferSent);
        assert_eq!(kinds(&mut rx), vec![SignalKind::Offer]);
        assert_eq!(*recorder.created.lock(), 1);
    }

    #[tokio::test]
    async fn test_glare_larger_id_yields_and_answers() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, mut rx) = negotiator("bob", "alice", recorder.clone());
        neg.initiate().await.unwrap();
        let first_generation = neg.generation();

        let outcome = neg.on_offer(SessionDescription::offer("x")).await.unwrap();

        assert_eq!(outcome, OfferOutcome::Restarted);
        assert_eq!(neg.state(), NegotiationState::Connected);
        assert_eq!(kinds(&mut rx), vec![SignalKind::Offer, SignalKind::Answer]);
        assert_eq!(*recorder.created.lock(), 2);
        assert_eq!(*recorder.closed.lock(), 1);
        assert!(neg.generation() > first_generation);
        assert!(!neg.accepts(first_generation));
    }

    #[tokio::test]
    async fn test_rejected_offer_closes() {
        let recorder = Arc::new(Recorder {
            reject_remote: true,
            ..Default::default()
        });
        let (mut neg, mut rx) = negotiator("2", "1", recorder.clone());

        let err = neg.on_offer(SessionDescription::offer("x")).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Negotiation(NegotiationError::DescriptionRejected(_))
        ));
        assert_eq!(neg.state(), NegotiationState::Closed);
        assert!(kinds(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_answer_keeps_offer_sent() {
        let recorder = Arc::new(Recorder {
            reject_remote: true,
            ..Default::default()
        });
        let (mut neg, _rx) = negotiator("1", "2", recorder);
        neg.initiate().await.unwrap();

        assert!(neg.on_answer(SessionDescription::answer("x")).await.is_err());
        assert_eq!(neg.state(), NegotiationState::OfferSent);
    }

    #[tokio::test]
    async fn test_bye_closes_and_discards_candidates() {
        let recorder = Arc::new(Recorder::default());
        let (mut neg, _rx) = negotiator("1", "2", recorder.clone());
        neg.initiate().await.unwrap();
        neg.on_candidate(candidate(1)).await.unwrap();

        neg.on_bye().await;

        assert_eq!(neg.state(), NegotiationState::Closed);
        assert_eq!(neg.pending_candidates(), 0);
        assert_eq!(*recorder.closed.lock(), 1);
        assert!(!neg.accepts(neg.generation()));
        assert!(neg.on_candidate(candidate(2)).await.is_err());
        assert!(neg.on_ready().is_err());

        // Closing twice releases once
        neg.close().await;
        assert_eq!(*recorder.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_ready_promotes_negotiated_session() {
        let (mut neg, _rx) = negotiator("1", "2", Arc::new(Recorder::default()));
        assert_eq!(neg.on_ready().unwrap(), NegotiationState::Idle);

        neg.initiate().await.unwrap();
        assert_eq!(neg.on_ready().unwrap(), NegotiationState::OfferSent);

        neg.on_answer(SessionDescription::answer("x")).await.unwrap();
        assert_eq!(neg.on_ready().unwrap(), NegotiationState::Connected);
    }
}
