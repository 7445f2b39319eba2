//! Channel id to session map
//!
//! The registry is the only owner of [`CallSession`]s. It creates at most
//! one session per channel id, routes envelopes and transport events to
//! it, and drops everything addressed to channels that do not involve the
//! local participant.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::protocol::{ChannelId, MediaKind, Participant, SignalKind, SignalingEnvelope};

use super::call::{CallEvent, CallSession, SessionOptions};
use super::error::NetworkError;
use super::negotiator::{NegotiationState, NegotiatorContext};
use super::transport::SessionEvent;

/// Point-in-time view of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: NegotiationState,
    /// Whether a data channel is open
    pub connected: bool,
}

pub struct SessionRegistry {
    participant: Participant,
    options: SessionOptions,
    context: NegotiatorContext,
    events: mpsc::UnboundedSender<CallEvent>,
    sessions: HashMap<ChannelId, CallSession>,
}

impl SessionRegistry {
    pub fn new(
        participant: Participant,
        options: SessionOptions,
        context: NegotiatorContext,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            participant,
            options,
            context,
            events,
            sessions: HashMap::new(),
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, channel_id: &ChannelId) -> bool {
        self.sessions.contains_key(channel_id)
    }

    pub fn status(&self, channel_id: &ChannelId) -> Option<SessionStatus> {
        self.sessions.get(channel_id).map(|session| SessionStatus {
            state: session.state(),
            connected: session.is_connected(),
        })
    }

    /// Get or create the session for `channel_id` and start the caller side
    pub async fn connect(&mut self, channel_id: &ChannelId) -> Result<(), NetworkError> {
        let session = self.session_for(channel_id)?;
        let result = session.connect().await;
        if let Err(e) = &result {
            warn!("Connect on {} failed: {}", channel_id, e);
        }
        self.reap(channel_id);
        result
    }

    /// Route one inbound envelope
    pub async fn dispatch(&mut self, envelope: SignalingEnvelope) {
        let channel_id = envelope.channel_id.clone();
        if !channel_id.involves(&self.participant) {
            trace!("Ignoring envelope for foreign channel {}", channel_id);
            return;
        }

        let live = self
            .sessions
            .get(&channel_id)
            .is_some_and(|session| !session.is_closed());

        if !live {
            match envelope.kind() {
                SignalKind::Offer => {
                    info!("Incoming call on {}", channel_id);
                }
                SignalKind::Answer => {
                    self.report(
                        &channel_id,
                        "Answer without an active offer dropped".to_string(),
                    );
                    return;
                }
                other => {
                    debug!("Dropping {:?} for unknown session {}", other, channel_id);
                    return;
                }
            }
        }

        let session = match self.session_for(&channel_id) {
            Ok(session) => session,
            Err(e) => {
                self.report(&channel_id, e.to_string());
                return;
            }
        };
        session.handle_envelope(envelope).await;
        self.reap(&channel_id);
    }

    /// Route one transport callback to its session
    pub async fn handle_transport_event(&mut self, event: SessionEvent) {
        let SessionEvent {
            channel_id,
            generation,
            event,
        } = event;
        match self.sessions.get_mut(&channel_id) {
            Some(session) => session.handle_transport_event(generation, event).await,
            None => trace!("Transport event for removed session {}", channel_id),
        }
    }

    pub async fn send_text(&mut self, channel_id: &ChannelId, text: &str) -> Result<(), NetworkError> {
        match self.sessions.get_mut(channel_id) {
            Some(session) => session.send_text(text).await,
            None => {
                warn!("No session for {}, dropping text", channel_id);
                Err(NetworkError::TransportUnavailable)
            }
        }
    }

    pub async fn send_media(
        &mut self,
        channel_id: &ChannelId,
        kind: MediaKind,
        payload: Bytes,
    ) -> Result<usize, NetworkError> {
        match self.sessions.get_mut(channel_id) {
            Some(session) => session.send_media(kind, payload).await,
            None => {
                warn!("No session for {}, dropping {:?} payload", channel_id, kind);
                Err(NetworkError::TransportUnavailable)
            }
        }
    }

    /// Hang up and forget one session
    pub async fn close(&mut self, channel_id: &ChannelId) {
        if let Some(mut session) = self.sessions.remove(channel_id) {
            session.close().await;
        }
    }

    /// Hang up every session
    pub async fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
    }

    /// The relay is gone: every session ends as if the peer said bye
    pub async fn relay_disconnected(&mut self) {
        if !self.sessions.is_empty() {
            warn!("Relay lost, closing {} sessions", self.sessions.len());
        }
        for (_, mut session) in self.sessions.drain() {
            session.shutdown().await;
        }
    }

    fn session_for(&mut self, channel_id: &ChannelId) -> Result<&mut CallSession, NetworkError> {
        let remote = channel_id
            .remote_user(&self.participant)
            .ok_or_else(|| NetworkError::ForeignChannel(channel_id.clone()))?
            .to_string();

        // A closed session is replaced by a fresh one
        if self
            .sessions
            .get(channel_id)
            .is_some_and(CallSession::is_closed)
        {
            self.sessions.remove(channel_id);
        }

        let session = self.sessions.entry(channel_id.clone()).or_insert_with(|| {
            debug!("New session {} with {}", channel_id, remote);
            CallSession::new(
                channel_id.clone(),
                &self.participant.user_id,
                &remote,
                self.context.clone(),
                &self.options,
                self.events.clone(),
            )
        });
        Ok(session)
    }

    fn reap(&mut self, channel_id: &ChannelId) {
        if self
            .sessions
            .get(channel_id)
            .is_some_and(CallSession::is_closed)
        {
            debug!("Removing closed session {}", channel_id);
            self.sessions.remove(channel_id);
        }
    }

    fn report(&self, channel_id: &ChannelId, message: String) {
        warn!("{}: {}", channel_id, message);
        let _ = self.events.send(CallEvent::Warning {
            channel_id: Some(channel_id.clone()),
            message,
        });
    }
}
