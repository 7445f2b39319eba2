//! Signaling envelopes exchanged through the relay
//!
//! Wire format (JSON text frame):
//!
//! ```text
//! { "type": "offer"|"answer"|"candidate"|"ready"|"bye",
//!   "channelName": "<channel id>",
//!   "data": <kind-specific> }
//! ```
//!
//! `offer`/`answer` carry `{ type, sdp }`, `candidate` carries
//! `{ candidate, sdpMid, sdpMLineIndex }`, `ready`/`bye` carry nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::channel_id::ChannelId;

/// Envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Ready,
    Bye,
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// A negotiated capability descriptor (offer or answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network path descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: Option<String>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, index: Option<u16>) -> Self {
        Self {
            candidate: Some(candidate.into()),
            sdp_mid,
            sdp_mline_index: index,
        }
    }
}

/// Kind-specific envelope payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Ready,
    Bye,
}

/// A typed signaling message scoped to one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    pub channel_id: ChannelId,
    pub payload: SignalPayload,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(rename = "channelName")]
    channel_name: ChannelId,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

impl SignalingEnvelope {
    pub fn new(channel_id: ChannelId, payload: SignalPayload) -> Self {
        Self {
            channel_id,
            payload,
        }
    }

    pub fn offer(channel_id: ChannelId, description: SessionDescription) -> Self {
        Self::new(channel_id, SignalPayload::Offer(description))
    }

    pub fn answer(channel_id: ChannelId, description: SessionDescription) -> Self {
        Self::new(channel_id, SignalPayload::Answer(description))
    }

    pub fn candidate(channel_id: ChannelId, candidate: IceCandidate) -> Self {
        Self::new(channel_id, SignalPayload::Candidate(candidate))
    }

    pub fn ready(channel_id: ChannelId) -> Self {
        Self::new(channel_id, SignalPayload::Ready)
    }

    pub fn bye(channel_id: ChannelId) -> Self {
        Self::new(channel_id, SignalPayload::Bye)
    }

    pub fn kind(&self) -> SignalKind {
        match self.payload {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::Candidate(_) => SignalKind::Candidate,
            SignalPayload::Ready => SignalKind::Ready,
            SignalPayload::Bye => SignalKind::Bye,
        }
    }

    /// Serialize to the JSON wire format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let data = match &self.payload {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => serde_json::to_value(desc)?,
            SignalPayload::Candidate(candidate) => serde_json::to_value(candidate)?,
            SignalPayload::Ready | SignalPayload::Bye => Value::Null,
        };

        serde_json::to_string(&WireEnvelope {
            kind: self.kind(),
            channel_name: self.channel_id.clone(),
            data,
        })
    }

    /// Parse the JSON wire format
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let wire: WireEnvelope = serde_json::from_str(text)?;

        let payload = match wire.kind {
            SignalKind::Offer => SignalPayload::Offer(serde_json::from_value(wire.data)?),
            SignalKind::Answer => SignalPayload::Answer(serde_json::from_value(wire.data)?),
            SignalKind::Candidate => SignalPayload::Candidate(serde_json::from_value(wire.data)?),
            SignalKind::Ready => SignalPayload::Ready,
            SignalKind::Bye => SignalPayload::Bye,
        };

        Ok(Self {
            channel_id: wire.channel_name,
            payload,
        })
    }
}
