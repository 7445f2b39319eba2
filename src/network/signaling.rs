//! Signaling relay server and client
//!
//! The relay is a plain broadcaster: every text frame received from one
//! connection is forwarded verbatim to every other connection. It knows
//! nothing about channels; scoping happens in the session registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::protocol::SignalingEnvelope;

use super::error::NetworkError;

/// Frames buffered per relay connection before a slow reader lags
pub const RELAY_BACKLOG: usize = 256;

/// Something that happened on the relay connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Envelope(SignalingEnvelope),
    Disconnected,
}

/// Inbound side of a relay connection
pub type RelayInbound = mpsc::UnboundedReceiver<RelayEvent>;

/// Outbound side of a relay connection
#[derive(Debug, Clone)]
pub struct SignalingChannel {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl SignalingChannel {
    pub fn new(tx: mpsc::UnboundedSender<SignalingEnvelope>) -> Self {
        Self { tx }
    }

    /// Queue an envelope for the relay
    pub fn send(&self, envelope: SignalingEnvelope) -> Result<(), NetworkError> {
        trace!("Signaling {:?} for {}", envelope.kind(), envelope.channel_id);
        self.tx
            .send(envelope)
            .map_err(|_| NetworkError::RelayDisconnected)
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Both halves of a relay connection
#[derive(Debug)]
pub struct RelayConnection {
    pub channel: SignalingChannel,
    pub inbound: RelayInbound,
}

#[derive(Debug, Clone)]
struct RelayFrame {
    from: Uuid,
    text: String,
}

/// Broadcast relay server
pub struct RelayServer {
    broadcast_tx: broadcast::Sender<RelayFrame>,
    connections: Arc<AtomicUsize>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(RELAY_BACKLOG);
        Self {
            broadcast_tx,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Serve plain websocket connections (ws://)
    pub async fn run(&self, addr: &str) -> Result<(), NetworkError> {
        self.accept_loop(addr, |relay, stream| async move { relay.accept(stream).await })
            .await
    }

    /// Serve websocket connections behind TLS (wss://)
    pub async fn run_tls(&self, addr: &str, acceptor: TlsAcceptor) -> Result<(), NetworkError> {
        self.accept_loop(addr, move |relay, stream| {
            let acceptor = acceptor.clone();
            async move { relay.accept_tls(stream, &acceptor).await }
        })
        .await
    }

    async fn accept_loop<F, Fut>(&self, addr: &str, serve: F) -> Result<(), NetworkError>
    where
        F: Fn(RelayHandle, TcpStream) -> Fut,
        Fut: Future<Output = Result<(), NetworkError>> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Bind failed: {}", e)))?;

        info!("Relay listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New relay connection from {}", peer_addr);
                    let connection = serve(self.handle(), stream);
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            warn!("Connection {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// A cheap handle for serving connections from spawned tasks
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            broadcast_tx: self.broadcast_tx.clone(),
            connections: self.connections.clone(),
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves individual relay connections
#[derive(Clone)]
pub struct RelayHandle {
    broadcast_tx: broadcast::Sender<RelayFrame>,
    connections: Arc<AtomicUsize>,
}

impl RelayHandle {
    /// Upgrade a byte stream to a websocket and serve it
    pub async fn accept<S>(&self, stream: S) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("WebSocket accept failed: {}", e)))?;
        self.serve(ws_stream).await
    }

    /// Finish the TLS handshake, then upgrade and serve
    pub async fn accept_tls(&self, stream: TcpStream, acceptor: &TlsAcceptor) -> Result<(), NetworkError> {
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("TLS handshake failed: {}", e)))?;
        self.accept(tls_stream).await
    }

    /// Relay frames for one websocket until it closes
    pub async fn serve<S>(&self, ws_stream: WebSocketStream<S>) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = Uuid::new_v4();
        let (mut write, mut read) = ws_stream.split();
        let mut broadcast_rx = self.broadcast_tx.subscribe();
        let live = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Relay connection {} joined ({} live)", id, live);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            trace!("Relaying {} bytes from {}", text.len(), id);
                            // No receivers is fine: nobody else is connected
                            let _ = self.broadcast_tx.send(RelayFrame { from: id, text });
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }

                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(frame) if frame.from != id => {
                            if write.send(Message::Text(frame.text)).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Relay connection {} lagged, {} frames dropped", id, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        let live = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Relay connection {} left ({} live)", id, live);
        Ok(())
    }
}

/// Client for a relay server
pub struct RelayClient {
    server_url: String,
}

impl RelayClient {
    /// Create a new relay client
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
        }
    }

    /// Connect to the relay and start pumping envelopes
    pub async fn connect(&self) -> Result<RelayConnection, NetworkError> {
        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Connect failed: {}", e)))?;

        debug!("Connected to relay: {}", self.server_url);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws_stream, out_rx, in_tx));

        Ok(RelayConnection {
            channel: SignalingChannel::new(out_tx),
            inbound: in_rx,
        })
    }
}

/// Move envelopes between the websocket and the local channels
async fn pump(
    ws_stream: WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
    in_tx: mpsc::UnboundedSender<RelayEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(envelope) = outbound else {
                    let _ = write.close().await;
                    break;
                };
                match envelope.to_json() {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to serialize envelope: {}", e),
                }
            }

            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match SignalingEnvelope::from_json(&text) {
                            Ok(envelope) => {
                                if in_tx.send(RelayEvent::Envelope(envelope)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Ignoring malformed relay frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Relay connection closed");
    let _ = in_tx.send(RelayEvent::Disconnected);
}

struct Member {
    inbound: mpsc::UnboundedSender<RelayEvent>,
    kill: Option<oneshot::Sender<()>>,
}

/// In-process relay with the same broadcast semantics as [`RelayServer`].
///
/// Envelopes go through the JSON wire format on the way.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    members: Arc<Mutex<HashMap<Uuid, Member>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new member
    pub fn join(&self) -> (Uuid, RelayConnection) {
        let id = Uuid::new_v4();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel();

        self.members.lock().insert(
            id,
            Member {
                inbound: in_tx,
                kill: Some(kill_tx),
            },
        );

        let members = self.members.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut kill_rx => break,
                    envelope = out_rx.recv() => {
                        let Some(envelope) = envelope else { break };
                        let text = match envelope.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to serialize envelope: {}", e);
                                continue;
                            }
                        };
                        let guard = members.lock();
                        for (member_id, member) in guard.iter() {
                            if *member_id == id {
                                continue;
                            }
                            match SignalingEnvelope::from_json(&text) {
                                Ok(parsed) => {
                                    let _ = member.inbound.send(RelayEvent::Envelope(parsed));
                                }
                                Err(e) => warn!("Dropping unparsable frame: {}", e),
                            }
                        }
                    }
                }
            }
        });

        (
            id,
            RelayConnection {
                channel: SignalingChannel::new(out_tx),
                inbound: in_rx,
            },
        )
    }

    /// Drop a member as if its relay connection failed
    pub fn disconnect(&self, id: Uuid) {
        if let Some(mut member) = self.members.lock().remove(&id) {
            if let Some(kill) = member.kill.take() {
                let _ = kill.send(());
            }
            let _ = member.inbound.send(RelayEvent::Disconnected);
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }
}
