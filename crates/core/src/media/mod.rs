//! Media sources, framing and RTP packetization.
//!
//! Raw elementary streams are loaded once into a [`MediaCache`] and read
//! through a [`CacheCursor`] by each session's pacer. Framers turn the
//! windows into [`FramedUnit`]s; a [`Packetizer`] turns each unit into the
//! RTP payload fragments written by the transport.
//!
//! | Media | Framer | Packetizer | Payload type |
//! |-------|--------|------------|--------------|
//! | PCMA audio | [`audio::AudioFramer`] | [`audio::AudioPacketizer`] | 8 |
//! | H.264 Annex B | [`annexb::NalFramer`] | [`h264::H264Packetizer`] | 123 (dynamic) |

pub mod annexb;
pub mod audio;
pub mod h264;
pub mod rtp;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{LoadgenError, Result};

/// Whether a session carries audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Codecs the control plane and transport know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    /// G.711 A-law, RFC 3551 static payload type 8.
    PcmAlaw,
    /// H.264, RFC 6184.
    H264,
}

impl CodecType {
    /// Encoding name as used in `a=rtpmap` and RTP profiles.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PcmAlaw => "PCMA",
            Self::H264 => "H264",
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Self::PcmAlaw => 8000,
            Self::H264 => 90000,
        }
    }
}

/// One H.264 NAL unit without its start code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub payload: Vec<u8>,
    /// Synthetic 90 kHz timestamp.
    pub timestamp: u32,
}

/// One fixed-size (or final partial) audio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub payload: Vec<u8>,
}

/// A unit produced by a framer and consumed once by the packet pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedUnit {
    Nal(NalUnit),
    Audio(AudioFrame),
}

impl FramedUnit {
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Nal(nal) => &nal.payload,
            Self::Audio(frame) => &frame.payload,
        }
    }
}

/// Payload of one RTP packet plus the header fields that vary per packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpFragment {
    pub payload: Vec<u8>,
    pub payload_type: u8,
    pub timestamp: u32,
    /// Set on the last fragment of a unit.
    pub marker: bool,
}

/// Codec-specific conversion of framed units into RTP fragments.
///
/// Header serialization is left to the transport; packetizers only decide
/// payload boundaries, marker bits and timestamps.
pub trait Packetizer: Send {
    fn packetize(&mut self, unit: FramedUnit) -> Vec<RtpFragment>;

    fn codec(&self) -> CodecType;

    fn payload_type(&self) -> u8;
}

/// Immutable in-memory copy of a media file, shared by every session.
///
/// Cloning is a reference-count bump. The contents never change after
/// [`load`](Self::load), so concurrent readers need no locking.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaCache {
    data: Arc<[u8]>,
}

impl MediaCache {
    /// Read an entire file into a new cache.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| LoadgenError::MediaLoad {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), bytes = data.len(), "media cache loaded");
        Ok(Self::from(data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Start a new read cursor at offset zero.
    pub fn cursor(&self, window: usize) -> CacheCursor {
        CacheCursor {
            cache: self.clone(),
            window: window.max(1),
            pos: 0,
        }
    }
}

impl From<Vec<u8>> for MediaCache {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl fmt::Debug for MediaCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaCache").field("len", &self.data.len()).finish()
    }
}

/// The audio and video caches of a generator, frozen before sessions start.
#[derive(Debug, Clone, Default)]
pub struct MediaLibrary {
    audio: Option<MediaCache>,
    video: Option<MediaCache>,
}

impl MediaLibrary {
    pub fn new(audio: Option<MediaCache>, video: Option<MediaCache>) -> Self {
        Self { audio, video }
    }

    pub fn with_audio(mut self, cache: MediaCache) -> Self {
        self.audio = Some(cache);
        self
    }

    pub fn with_video(mut self, cache: MediaCache) -> Self {
        self.video = Some(cache);
        self
    }

    pub fn get(&self, kind: MediaKind) -> Result<&MediaCache> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
        .ok_or(LoadgenError::MediaMissing(kind))
    }
}

/// Result of advancing a [`CacheCursor`].
#[derive(Debug, PartialEq, Eq)]
pub enum Window<'a> {
    /// A full window; more data follows.
    Full(&'a [u8]),
    /// The last, shorter-than-window bytes of the cache.
    Tail(&'a [u8]),
    /// Nothing left to read.
    Exhausted,
}

/// A private read position over a shared [`MediaCache`].
#[derive(Debug, Clone)]
pub struct CacheCursor {
    cache: MediaCache,
    window: usize,
    pos: usize,
}

impl CacheCursor {
    /// Take the next window and advance past it.
    ///
    /// A window is `Full` whenever at least `window` bytes remain, so a
    /// cache whose length is a multiple of the window ends with `Exhausted`
    /// rather than a `Tail`.
    pub fn next_window(&mut self) -> Window<'_> {
        let data = self.cache.as_bytes();
        let remaining = data.len() - self.pos;
        let start = self.pos;

        if remaining >= self.window {
            self.pos += self.window;
            Window::Full(&data[start..self.pos])
        } else if remaining > 0 {
            self.pos = data.len();
            Window::Tail(&data[start..])
        } else {
            Window::Exhausted
        }
    }

    /// Move back to the beginning of the cache.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}
