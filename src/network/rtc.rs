//! WebRTC transport backed by webrtc-rs

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::protocol::{ChannelMessage, IceCandidate, SdpType, SessionDescription};

use super::error::TransportError;
use super::transport::{
    ChannelState, DataChannel, PeerTransport, TransportEvent, TransportFactory, TransportSink,
};

/// Public STUN server used when none is configured
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

fn failed(e: webrtc::Error) -> TransportError {
    TransportError::Failed(e.to_string())
}

/// Creates one `RTCPeerConnection` per negotiation attempt
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        let ice_servers = if ice_servers.is_empty() {
            vec![DEFAULT_ICE_SERVER.to_string()]
        } else {
            ice_servers
        };
        Self { ice_servers }
    }
}

impl Default for RtcTransportFactory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, sink: TransportSink) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(failed)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(failed)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(failed)?);

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(IceCandidate {
                            candidate: Some(init.candidate),
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(e) => {
                            warn!("Unserializable local candidate: {}", e);
                            return;
                        }
                    },
                    None => None,
                };
                sink.emit(TransportEvent::CandidateDiscovered(candidate));
            })
        }));

        let channel_sink = sink.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let sink = channel_sink.clone();
            Box::pin(async move {
                debug!("Remote opened data channel '{}'", channel.label());
                let channel = RtcChannel::wire(channel, sink.clone());
                sink.emit(TransportEvent::IncomingChannel(channel));
            })
        }));

        debug!("Created peer connection for {}", sink.channel_id());
        Ok(Arc::new(RtcTransport { pc, sink }))
    }
}

/// A webrtc-rs peer connection
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    sink: TransportSink,
}

impl RtcTransport {
    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let SessionDescription { sdp_type, sdp } = description;
        match sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
            SdpType::Rollback => {
                return Err(TransportError::Failed("rollback is not supported".into()))
            }
        }
        .map_err(failed)
    }

    fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
        let sdp_type = match description.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => {
                return Err(TransportError::Failed("unspecified description type".into()))
            }
        };
        Ok(SessionDescription {
            sdp_type,
            sdp: description.sdp,
        })
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Self::from_rtc(self.pc.create_offer(None).await.map_err(failed)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Self::from_rtc(self.pc.create_answer(None).await.map_err(failed)?)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(failed)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(failed)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.unwrap_or_default(),
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(failed)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(failed)?;
        Ok(RtcChannel::wire(channel, self.sink.clone()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(failed)
    }
}

/// A webrtc-rs data channel
pub struct RtcChannel {
    label: String,
    channel: Arc<RTCDataChannel>,
}

impl RtcChannel {
    /// Route the channel's callbacks into `sink`
    fn wire(channel: Arc<RTCDataChannel>, sink: TransportSink) -> Arc<dyn DataChannel> {
        let label = channel.label().to_string();

        let (open_sink, open_label) = (sink.clone(), label.clone());
        channel.on_open(Box::new(move || {
            open_sink.emit(TransportEvent::ChannelStateChanged {
                label: open_label,
                state: ChannelState::Open,
            });
            Box::pin(async {})
        }));

        let (close_sink, close_label) = (sink.clone(), label.clone());
        channel.on_close(Box::new(move || {
            close_sink.emit(TransportEvent::ChannelStateChanged {
                label: close_label.clone(),
                state: ChannelState::Closed,
            });
            Box::pin(async {})
        }));

        let message_label = label.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let message = if msg.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Binary(msg.data)
            };
            trace!("Channel '{}' message of {} bytes", message_label, message.len());
            sink.emit(TransportEvent::ChannelMessage {
                label: message_label.clone(),
                message,
            });
            Box::pin(async {})
        }));

        Arc::new(Self { label, channel })
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        match self.channel.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(failed)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.channel.send(&data).await.map(|_| ()).map_err(failed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.close().await.map_err(failed)
    }
}
