//! Wire protocol definitions
//!
//! Channel identifiers, signaling envelopes and the chunked media framing
//! carried over data channels. Nothing in here performs I/O.

mod channel_id;
mod chunk;
mod envelope;

pub use channel_id::{ChannelId, Participant};
pub use chunk::{
    ChannelMessage, ChunkDecodeError, ChunkedTransferCodec, Decoded, FrameFormat, Frames,
    MediaKind, AUDIO_SENTINEL, DEFAULT_CHUNK_SIZE, FRAME_INDEX_SIZE, VIDEO_SENTINEL,
};
pub use envelope::{
    IceCandidate, SdpType, SessionDescription, SignalKind, SignalPayload, SignalingEnvelope,
};
