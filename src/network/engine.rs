//! Call engine
//!
//! One task owns the [`SessionRegistry`] and processes, one at a time,
//! relay envelopes, transport callbacks and commands from [`CallHandle`]s.
//! Nothing else touches session state.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{ChannelId, MediaKind, Participant};

use super::call::{CallEvent, SessionOptions};
use super::error::NetworkError;
use super::negotiator::NegotiatorContext;
use super::registry::{SessionRegistry, SessionStatus};
use super::signaling::{RelayConnection, RelayEvent, RelayInbound};
use super::transport::{SessionEvent, TransportFactory};

const COMMAND_BACKLOG: usize = 64;

enum Command {
    Connect {
        channel_id: ChannelId,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    SendText {
        channel_id: ChannelId,
        text: String,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    SendMedia {
        channel_id: ChannelId,
        kind: MediaKind,
        payload: Bytes,
        reply: oneshot::Sender<Result<usize, NetworkError>>,
    },
    Close {
        channel_id: ChannelId,
        reply: oneshot::Sender<()>,
    },
    Status {
        channel_id: ChannelId,
        reply: oneshot::Sender<Option<SessionStatus>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end of a running [`CallEngine`]
#[derive(Clone)]
pub struct CallHandle {
    participant: Participant,
    commands: mpsc::Sender<Command>,
}

impl CallHandle {
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Channel id of a call with `peer_id`
    pub fn channel_with(&self, peer_id: &str) -> ChannelId {
        self.participant.channel_with(peer_id)
    }

    /// Start (or join) the session on `channel_id`
    pub async fn connect(&self, channel_id: &ChannelId) -> Result<(), NetworkError> {
        let channel_id = channel_id.clone();
        self.request(|reply| Command::Connect { channel_id, reply })
            .await?
    }

    /// Call `peer_id` and return the session's channel id
    pub async fn call(&self, peer_id: &str) -> Result<ChannelId, NetworkError> {
        let channel_id = self.channel_with(peer_id);
        self.connect(&channel_id).await?;
        Ok(channel_id)
    }

    pub async fn send_text(&self, channel_id: &ChannelId, text: impl Into<String>) -> Result<(), NetworkError> {
        let channel_id = channel_id.clone();
        let text = text.into();
        self.request(|reply| Command::SendText {
            channel_id,
            text,
            reply,
        })
        .await?
    }

    /// Send `payload` as a chunked transfer; returns the number of frames
    pub async fn send_media(
        &self,
        channel_id: &ChannelId,
        kind: MediaKind,
        payload: impl Into<Bytes>,
    ) -> Result<usize, NetworkError> {
        let channel_id = channel_id.clone();
        let payload = payload.into();
        self.request(|reply| Command::SendMedia {
            channel_id,
            kind,
            payload,
            reply,
        })
        .await?
    }

    pub async fn close(&self, channel_id: &ChannelId) -> Result<(), NetworkError> {
        let channel_id = channel_id.clone();
        self.request(|reply| Command::Close { channel_id, reply })
            .await
    }

    pub async fn status(&self, channel_id: &ChannelId) -> Result<Option<SessionStatus>, NetworkError> {
        let channel_id = channel_id.clone();
        self.request(|reply| Command::Status { channel_id, reply })
            .await
    }

    /// Close every session and stop the engine
    pub async fn shutdown(&self) -> Result<(), NetworkError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| NetworkError::EngineStopped)?;
        rx.await.map_err(|_| NetworkError::EngineStopped)
    }
}

/// The event loop owning every session of one participant
pub struct CallEngine {
    registry: SessionRegistry,
    relay: RelayInbound,
    relay_open: bool,
    transport_events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<CallEvent>,
}

impl CallEngine {
    /// Build an engine on top of a relay connection.
    ///
    /// The returned receiver is the only sink of [`CallEvent`]s.
    pub fn new(
        participant: Participant,
        options: SessionOptions,
        factory: Arc<dyn TransportFactory>,
        relay: RelayConnection,
    ) -> (Self, CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BACKLOG);

        let context = NegotiatorContext {
            signaling: relay.channel,
            factory,
            events: transport_tx,
            generations: Arc::new(AtomicU64::new(0)),
        };
        let handle = CallHandle {
            participant: participant.clone(),
            commands: command_tx,
        };
        let engine = Self {
            registry: SessionRegistry::new(participant, options, context, event_tx.clone()),
            relay: relay.inbound,
            relay_open: true,
            transport_events: transport_rx,
            commands: command_rx,
            events: event_tx,
        };
        (engine, handle, event_rx)
    }

    /// Build an engine and run it on a new task
    pub fn spawn(
        participant: Participant,
        options: SessionOptions,
        factory: Arc<dyn TransportFactory>,
        relay: RelayConnection,
    ) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>, JoinHandle<()>) {
        let (engine, handle, events) = Self::new(participant, options, factory, relay);
        let task = tokio::spawn(engine.run());
        (handle, events, task)
    }

    /// Run until shut down or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Call engine started for {} in {}",
            self.registry.participant().user_id,
            self.registry.participant().tenant
        );

        loop {
            tokio::select! {
                event = self.relay.recv(), if self.relay_open => {
                    match event {
                        Some(RelayEvent::Envelope(envelope)) => {
                            self.registry.dispatch(envelope).await;
                        }
                        Some(RelayEvent::Disconnected) | None => {
                            self.relay_lost().await;
                        }
                    }
                }

                Some(event) = self.transport_events.recv() => {
                    self.registry.handle_transport_event(event).await;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown { reply }) => {
                            self.registry.close_all().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.execute(command).await,
                        None => {
                            debug!("All handles dropped");
                            self.registry.close_all().await;
                            break;
                        }
                    }
                }
            }
        }

        info!("Call engine stopped");
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { channel_id, reply } => {
                let _ = reply.send(self.registry.connect(&channel_id).await);
            }
            Command::SendText {
                channel_id,
                text,
                reply,
            } => {
                let _ = reply.send(self.registry.send_text(&channel_id, &text).await);
            }
            Command::SendMedia {
                channel_id,
                kind,
                payload,
                reply,
            } => {
                let _ = reply.send(self.registry.send_media(&channel_id, kind, payload).await);
            }
            Command::Close { channel_id, reply } => {
                self.registry.close(&channel_id).await;
                let _ = reply.send(());
            }
            Command::Status { channel_id, reply } => {
                let _ = reply.send(self.registry.status(&channel_id));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn relay_lost(&mut self) {
        self.relay_open = false;
        warn!("Relay disconnected");
        self.registry.relay_disconnected().await;
        let _ = self.events.send(CallEvent::Warning {
            channel_id: None,
            message: NetworkError::RelayDisconnected.to_string(),
        });
    }
}
