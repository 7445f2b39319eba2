//! Chunked transfer of binary media over a message channel
//!
//! A payload is split into frames of at most `chunk_size` bytes, sent in
//! order, and terminated by an in-band text sentinel naming the media kind:
//!
//! ```text
//! frame 0 | frame 1 | ... | frame n-1 | "[[Video Chunks Complete]]"
//! ```
//!
//! Frame layout depends on [`FrameFormat`]:
//! - `Indexed`: 4-byte big-endian frame index followed by the chunk bytes.
//!   Reassembly does not depend on arrival order.
//! - `Raw`: bare chunk bytes. Reassembly relies on in-order delivery.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Default frame payload size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 16384;

/// Sentinel terminating a video transfer
pub const VIDEO_SENTINEL: &str = "[[Video Chunks Complete]]";

/// Sentinel terminating an audio transfer
pub const AUDIO_SENTINEL: &str = "[[Audio Chunks Complete]]";

/// Size of the frame index prefix in `Indexed` format
pub const FRAME_INDEX_SIZE: usize = 4;

/// Media kind of a chunked transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// End-of-stream token for this kind
    pub fn sentinel(self) -> &'static str {
        match self {
            MediaKind::Video => VIDEO_SENTINEL,
            MediaKind::Audio => AUDIO_SENTINEL,
        }
    }

    /// Match a text message against the sentinel tokens
    pub fn from_sentinel(text: &str) -> Option<Self> {
        match text {
            VIDEO_SENTINEL => Some(MediaKind::Video),
            AUDIO_SENTINEL => Some(MediaKind::Audio),
            _ => None,
        }
    }
}

/// Binary frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    #[default]
    Indexed,
    Raw,
}

/// A single data channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Output of the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// An ordinary text message
    Text(String),
    /// A reassembled media payload
    Media { kind: MediaKind, payload: Bytes },
}

/// Reassembly failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkDecodeError {
    #[error("{kind:?} sentinel with no buffered data")]
    EmptyTransfer { kind: MediaKind },

    #[error("{kind:?} transfer is missing frame {index}")]
    MissingFrame { kind: MediaKind, index: u32 },

    #[error("{kind:?} transfer received frame {index} twice")]
    DuplicateFrame { kind: MediaKind, index: u32 },

    #[error("{kind:?} transfer contained a malformed frame of {len} bytes")]
    MalformedFrame { kind: MediaKind, len: usize },
}

/// First fault seen while buffering; reported at finalize time
#[derive(Debug, Clone, Copy)]
enum Fault {
    Duplicate(u32),
    Malformed(usize),
}

/// Fragments of the in-flight inbound transfer
#[derive(Debug, Default)]
struct ChunkBuffer {
    raw: Vec<Bytes>,
    indexed: BTreeMap<u32, Bytes>,
    fault: Option<Fault>,
    bytes: usize,
}

impl ChunkBuffer {
    fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.indexed.is_empty() && self.fault.is_none()
    }

    fn push_raw(&mut self, fragment: Bytes) {
        self.bytes += fragment.len();
        self.raw.push(fragment);
    }

    fn push_indexed(&mut self, frame: Bytes) {
        if frame.len() < FRAME_INDEX_SIZE {
            self.fault.get_or_insert(Fault::Malformed(frame.len()));
            return;
        }

        let index = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let chunk = frame.slice(FRAME_INDEX_SIZE..);
        if self.indexed.contains_key(&index) {
            self.fault.get_or_insert(Fault::Duplicate(index));
            return;
        }

        self.bytes += chunk.len();
        self.indexed.insert(index, chunk);
    }

    /// Concatenate the buffered fragments and clear the buffer
    fn finalize(&mut self, kind: MediaKind) -> Result<Bytes, ChunkDecodeError> {
        let buffer = std::mem::take(self);

        match buffer.fault {
            Some(Fault::Duplicate(index)) => {
                return Err(ChunkDecodeError::DuplicateFrame { kind, index })
            }
            Some(Fault::Malformed(len)) => return Err(ChunkDecodeError::MalformedFrame { kind, len }),
            None => {}
        }

        let mut out = BytesMut::with_capacity(buffer.bytes);

        if !buffer.raw.is_empty() {
            for fragment in &buffer.raw {
                out.extend_from_slice(fragment);
            }
        } else {
            for (expected, (index, chunk)) in (0u32..).zip(buffer.indexed.iter()) {
                if *index != expected {
                    return Err(ChunkDecodeError::MissingFrame {
                        kind,
                        index: expected,
                    });
                }
                out.extend_from_slice(chunk);
            }
        }

        // Zero-length fragments carry nothing to hand over
        if out.is_empty() {
            return Err(ChunkDecodeError::EmptyTransfer { kind });
        }
        Ok(out.freeze())
    }
}

/// Iterator over the frames (and trailing sentinel) of one outbound transfer
pub struct Frames {
    payload: Bytes,
    chunk_size: usize,
    format: FrameFormat,
    kind: MediaKind,
    offset: usize,
    index: u32,
    done: bool,
}

impl Iterator for Frames {
    type Item = ChannelMessage;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.offset >= self.payload.len() {
            self.done = true;
            return Some(ChannelMessage::Text(self.kind.sentinel().to_string()));
        }

        let end = (self.offset + self.chunk_size).min(self.payload.len());
        let chunk = self.payload.slice(self.offset..end);
        self.offset = end;

        let frame = match self.format {
            FrameFormat::Raw => chunk,
            FrameFormat::Indexed => {
                let mut buf = BytesMut::with_capacity(FRAME_INDEX_SIZE + chunk.len());
                buf.put_u32(self.index);
                buf.extend_from_slice(&chunk);
                buf.freeze()
            }
        };
        self.index = self.index.wrapping_add(1);

        Some(ChannelMessage::Binary(frame))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let remaining = self.payload.len().saturating_sub(self.offset);
        let count = remaining.div_ceil(self.chunk_size) + 1;
        (count, Some(count))
    }
}

impl ExactSizeIterator for Frames {}

/// Splits outbound payloads into frames and reassembles inbound frames
#[derive(Debug)]
pub struct ChunkedTransferCodec {
    chunk_size: usize,
    format: FrameFormat,
    inbound: ChunkBuffer,
    outbound: Option<MediaKind>,
}

impl ChunkedTransferCodec {
    /// Create a codec; a zero `chunk_size` falls back to [`DEFAULT_CHUNK_SIZE`]
    pub fn new(chunk_size: usize, format: FrameFormat) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            chunk_size,
            format,
            inbound: ChunkBuffer::default(),
            outbound: None,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Number of binary frames a payload of `len` bytes is split into
    pub fn frame_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Frames for `payload`, followed by the sentinel for `kind`
    pub fn encode(&self, kind: MediaKind, payload: Bytes) -> Frames {
        Frames {
            payload,
            chunk_size: self.chunk_size,
            format: self.format,
            kind,
            offset: 0,
            index: 0,
            done: false,
        }
    }

    /// Mark an outbound transfer as started.
    ///
    /// Returns `false` when another transfer has not finished yet.
    pub fn begin_transfer(&mut self, kind: MediaKind) -> bool {
        if self.outbound.is_some() {
            return false;
        }
        self.outbound = Some(kind);
        true
    }

    /// Mark the outbound transfer as complete (its sentinel was handed off)
    pub fn finish_transfer(&mut self) {
        self.outbound = None;
    }

    /// Media kind of the outbound transfer in flight, if any
    pub fn transfer_in_flight(&self) -> Option<MediaKind> {
        self.outbound
    }

    /// Bytes buffered for the inbound transfer
    pub fn buffered_bytes(&self) -> usize {
        self.inbound.bytes
    }

    /// Feed one inbound message.
    ///
    /// Binary messages are buffered and yield `Ok(None)`. A sentinel
    /// finalizes the buffer into a media payload. Any other text is
    /// returned as-is without touching the buffer.
    pub fn decode(&mut self, message: ChannelMessage) -> Result<Option<Decoded>, ChunkDecodeError> {
        match message {
            ChannelMessage::Binary(frame) => {
                trace!("Buffered {} byte frame", frame.len());
                match self.format {
                    FrameFormat::Raw => self.inbound.push_raw(frame),
                    FrameFormat::Indexed => self.inbound.push_indexed(frame),
                }
                Ok(None)
            }
            ChannelMessage::Text(text) => match MediaKind::from_sentinel(&text) {
                Some(kind) => {
                    let payload = self.inbound.finalize(kind)?;
                    debug!("Reassembled {:?} payload of {} bytes", kind, payload.len());
                    Ok(Some(Decoded::Media { kind, payload }))
                }
                None => Ok(Some(Decoded::Text(text))),
            },
        }
    }

    /// Drop buffered fragments and any outbound marker
    pub fn reset(&mut self) {
        if !self.inbound.is_empty() {
            debug!("Discarding {} buffered bytes", self.inbound.bytes);
        }
        self.inbound = ChunkBuffer::default();
        self.outbound = None;
    }
}

impl Default for ChunkedTransferCodec {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, FrameFormat::default())
    }
}
