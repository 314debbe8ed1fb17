//! Fixed-size audio framing and packetization.
//!
//! The generator has no codec awareness: an A-law file is simply cut into
//! 160-byte frames, one per 20 ms RTP packet at 8 kHz.

use super::{
    AudioFrame, CacheCursor, CodecType, FramedUnit, MediaCache, Packetizer, RtpFragment, Window,
};

/// Outcome of [`AudioFramer::next_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum AudioStep {
    /// A full frame; more follow.
    Frame(AudioFrame),
    /// The final, shorter frame of the cache.
    Tail(AudioFrame),
    /// The cache has been fully read.
    Exhausted,
}

/// Slices a [`MediaCache`] into contiguous fixed-size frames.
#[derive(Debug)]
pub struct AudioFramer {
    cursor: CacheCursor,
}

impl AudioFramer {
    pub fn new(cache: MediaCache, frame_size: usize) -> Self {
        Self {
            cursor: cache.cursor(frame_size),
        }
    }

    pub fn next_frame(&mut self) -> AudioStep {
        match self.cursor.next_window() {
            Window::Full(bytes) => AudioStep::Frame(AudioFrame {
                payload: bytes.to_vec(),
            }),
            Window::Tail(bytes) => AudioStep::Tail(AudioFrame {
                payload: bytes.to_vec(),
            }),
            Window::Exhausted => AudioStep::Exhausted,
        }
    }

    /// Restart from the first frame (looping playback).
    pub fn rewind(&mut self) {
        self.cursor.rewind();
    }
}

/// One RTP packet per audio frame with a sample-count timestamp.
#[derive(Debug)]
pub struct AudioPacketizer {
    payload_type: u8,
    timestamp: u32,
    timestamp_step: u32,
}

impl AudioPacketizer {
    pub fn new(payload_type: u8, timestamp_step: u32) -> Self {
        Self {
            payload_type,
            timestamp: 0,
            timestamp_step,
        }
    }
}

impl Packetizer for AudioPacketizer {
    fn packetize(&mut self, unit: FramedUnit) -> Vec<RtpFragment> {
        let FramedUnit::Audio(frame) = unit else {
            tracing::warn!("audio packetizer received a non-audio unit");
            return Vec::new();
        };

        let fragment = RtpFragment {
            payload: frame.payload,
            payload_type: self.payload_type,
            timestamp: self.timestamp,
            marker: false,
        };
        self.timestamp = self.timestamp.wrapping_add(self.timestamp_step);
        vec![fragment]
    }

    fn codec(&self) -> CodecType {
        CodecType::PcmAlaw
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NalUnit;

    fn cache(len: usize) -> MediaCache {
        MediaCache::from((0..len).map(|i| i as u8).collect::<Vec<_>>())
    }

    #[test]
    fn five_hundred_bytes_make_three_frames_and_a_tail() {
        let source = cache(500);
        let mut framer = AudioFramer::new(source.clone(), 160);
        let bytes = source.as_bytes();

        for range in [0..160, 160..320, 320..480] {
            match framer.next_frame() {
                AudioStep::Frame(frame) => assert_eq!(frame.payload, &bytes[range]),
                other => panic!("expected full frame, got {other:?}"),
            }
        }
        match framer.next_frame() {
            AudioStep::Tail(frame) => {
                assert_eq!(frame.payload.len(), 20);
                assert_eq!(frame.payload, &bytes[480..500]);
            }
            other => panic!("expected tail, got {other:?}"),
        }
        assert_eq!(framer.next_frame(), AudioStep::Exhausted);
    }

    #[test]
    fn rewind_restarts_at_zero() {
        let mut framer = AudioFramer::new(cache(200), 160);
        framer.next_frame();
        framer.next_frame();
        framer.rewind();
        match framer.next_frame() {
            AudioStep::Frame(frame) => assert_eq!(frame.payload[0], 0),
            other => panic!("expected full frame, got {other:?}"),
        }
    }

    #[test]
    fn short_cache_is_a_single_tail() {
        let mut framer = AudioFramer::new(cache(50), 160);
        assert!(matches!(framer.next_frame(), AudioStep::Tail(f) if f.payload.len() == 50));
        assert_eq!(framer.next_frame(), AudioStep::Exhausted);
    }

    #[test]
    fn packetizer_advances_timestamp_per_packet() {
        let mut p = AudioPacketizer::new(8, 160);
        let frame = || FramedUnit::Audio(AudioFrame { payload: vec![0xD5; 160] });

        let first = p.packetize(frame());
        let second = p.packetize(frame());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].timestamp, 0);
        assert_eq!(second[0].timestamp, 160);
        assert_eq!(second[0].payload_type, 8);
        assert!(!second[0].marker);
        assert_eq!(p.codec().name(), "PCMA");
    }

    #[test]
    fn packetizer_ignores_video_units() {
        let mut p = AudioPacketizer::new(8, 160);
        let nal = FramedUnit::Nal(NalUnit {
            payload: vec![0x65],
            timestamp: 3600,
        });
        assert!(p.packetize(nal).is_empty());
    }
}
