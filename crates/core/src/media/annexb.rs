//! Incremental H.264 Annex B framing.
//!
//! Annex B bitstreams delimit NAL units with start codes:
//! - 4-byte: `0x00 0x00 0x00 0x01`
//! - 3-byte: `0x00 0x00 0x01`
//!
//! Input arrives in arbitrary windows, so a NAL unit is only emitted once
//! the start code of the *following* unit has been seen. Everything after
//! the last start code stays buffered for the next window.

use super::NalUnit;

const START_CODE_4: [u8; 4] = [0, 0, 0, 1];
const START_CODE_3: [u8; 3] = [0, 0, 1];

/// Default synthetic timestamp advance per NAL unit (90 kHz / 25 fps).
pub const DEFAULT_TIMESTAMP_STEP: u32 = 3600;

/// Locate the earliest start code at or after `from`.
///
/// Returns `(offset, start_code_length)`. A 4-byte code is reported as
/// such even though it contains a 3-byte code one byte later, because it
/// begins first.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i..].starts_with(&START_CODE_4) {
            return Some((i, 4));
        }
        if data[i..].starts_with(&START_CODE_3) {
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Stateful NAL unit extractor with a synthetic clock.
#[derive(Debug)]
pub struct NalFramer {
    buffer: Vec<u8>,
    /// Length of the start code at `buffer[0]`, once one has been found.
    head: Option<usize>,
    timestamp: u32,
    timestamp_step: u32,
}

impl NalFramer {
    pub fn new(timestamp_step: u32) -> Self {
        Self {
            buffer: Vec::new(),
            head: None,
            timestamp: 0,
            timestamp_step,
        }
    }

    /// Bytes waiting for the next start code.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Append `chunk` and return every NAL unit it completes.
    ///
    /// Scanning resumes where the previous call stopped. Positions more
    /// than three bytes before the old end have already been checked with
    /// full lookahead.
    pub fn extract_units(&mut self, chunk: &[u8]) -> Vec<NalUnit> {
        let resume = self.buffer.len().saturating_sub(START_CODE_4.len() - 1);
        self.buffer.extend_from_slice(chunk);

        let mut units = Vec::new();
        let (mut code_at, mut code_len) = match self.head {
            Some(len) => (0, len),
            None => match find_start_code(&self.buffer, resume) {
                Some(found) => found,
                None => {
                    // Only a start code straddling the boundary matters.
                    let keep_from = self.buffer.len().saturating_sub(START_CODE_4.len() - 1);
                    self.buffer.drain(..keep_from);
                    return units;
                }
            },
        };

        let mut scan_from = resume;
        loop {
            let payload_start = code_at + code_len;
            let Some((next_at, next_len)) = find_start_code(&self.buffer, scan_from.max(payload_start)) else {
                break;
            };
            if next_at > payload_start {
                let payload = self.buffer[payload_start..next_at].to_vec();
                units.push(self.stamp(payload));
            }
            code_at = next_at;
            code_len = next_len;
            scan_from = 0;
        }

        // Keep the unfinished unit, including its start code.
        self.buffer.drain(..code_at);
        self.head = Some(code_len);

        if !units.is_empty() {
            tracing::trace!(
                units = units.len(),
                buffered = self.buffer.len(),
                ts = self.timestamp,
                "NAL units extracted"
            );
        }
        units
    }

    /// Emit the buffered final unit at end of stream.
    ///
    /// Returns `None` if the buffer holds no start code or only an empty
    /// unit. The buffer is cleared either way.
    pub fn finish(&mut self) -> Option<NalUnit> {
        let buffer = std::mem::take(&mut self.buffer);
        let code_len = self.head.take()?;
        let payload = &buffer[code_len..];
        if payload.is_empty() {
            return None;
        }
        Some(self.stamp(payload.to_vec()))
    }

    fn stamp(&mut self, payload: Vec<u8>) -> NalUnit {
        self.timestamp = self.timestamp.wrapping_add(self.timestamp_step);
        NalUnit {
            payload,
            timestamp: self.timestamp,
        }
    }
}

impl Default for NalFramer {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_STEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(units: &[NalUnit]) -> Vec<Vec<u8>> {
        units.iter().map(|u| u.payload.clone()).collect()
    }

    #[test]
    fn find_prefers_earliest_code() {
        assert_eq!(find_start_code(&[0, 0, 0, 1, 0x65], 0), Some((0, 4)));
        assert_eq!(find_start_code(&[0xAA, 0, 0, 1, 0x65], 0), Some((1, 3)));
        assert_eq!(find_start_code(&[0, 0], 0), None);
        assert_eq!(find_start_code(&[0, 0, 1, 0x67, 0, 0, 1], 3), Some((4, 3)));
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut framer = NalFramer::default();
        assert!(framer.extract_units(&[]).is_empty());
        assert!(framer.buffered().is_empty());
    }

    #[test]
    fn single_start_code_is_withheld() {
        let mut framer = NalFramer::default();
        assert!(framer.extract_units(&[0, 0, 0, 1, 0x65, 0xAA]).is_empty());
        assert_eq!(framer.buffered(), &[0, 0, 0, 1, 0x65, 0xAA]);
    }

    #[test]
    fn no_start_code_stays_buffered() {
        let mut framer = NalFramer::default();
        assert!(framer.extract_units(&[0xFF, 0xFE, 0x00]).is_empty());
        assert_eq!(framer.buffered(), &[0xFF, 0xFE, 0x00]);
    }

    #[test]
    fn mixed_start_codes() {
        let mut framer = NalFramer::default();
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65]);

        let units = framer.extract_units(&data);
        assert_eq!(payloads(&units), vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
        assert_eq!(framer.buffered(), &[0, 0, 0, 1, 0x65]);
    }

    #[test]
    fn timestamps_advance_across_calls() {
        let mut framer = NalFramer::default();
        let first = framer.extract_units(&[0, 0, 1, 0x67, 0, 0, 1, 0x68]);
        let second = framer.extract_units(&[0, 0, 1, 0x65]);
        assert_eq!(first[0].timestamp, 3600);
        assert_eq!(second[0].timestamp, 7200);
        assert_eq!(second[0].payload, vec![0x68]);
    }

    #[test]
    fn start_code_split_across_chunks() {
        let mut framer = NalFramer::default();
        assert!(framer.extract_units(&[0, 0, 0, 1, 0x67, 0x42, 0x00]).is_empty());
        let units = framer.extract_units(&[0x00, 0x01, 0x68]);
        assert_eq!(payloads(&units), vec![vec![0x67, 0x42]]);
    }

    #[test]
    fn leading_garbage_is_dropped() {
        let mut framer = NalFramer::default();
        let units = framer.extract_units(&[0xAB, 0xCD, 0, 0, 1, 0x09, 0, 0, 1, 0x65]);
        assert_eq!(payloads(&units), vec![vec![0x09]]);
        assert_eq!(framer.buffered(), &[0, 0, 1, 0x65]);
    }

    #[test]
    fn adjacent_start_codes_skip_empty_unit() {
        let mut framer = NalFramer::default();
        let units = framer.extract_units(&[0, 0, 1, 0, 0, 1, 0x67, 0, 0, 1]);
        assert_eq!(payloads(&units), vec![vec![0x67]]);
        assert_eq!(units[0].timestamp, 3600);
    }

    #[test]
    fn finish_flushes_last_unit() {
        let mut framer = NalFramer::default();
        framer.extract_units(&[0, 0, 0, 1, 0x65, 0x88]);
        let last = framer.finish().unwrap();
        assert_eq!(last.payload, vec![0x65, 0x88]);
        assert!(framer.buffered().is_empty());
        assert!(framer.finish().is_none());
    }

    #[test]
    fn start_code_free_input_keeps_only_boundary_bytes() {
        let mut framer = NalFramer::default();
        let window = vec![0xAB; 4096];
        for _ in 0..1000 {
            assert!(framer.extract_units(&window).is_empty());
            assert!(framer.buffered().len() < 8);
        }
        assert!(framer.finish().is_none());
    }

    #[test]
    fn start_code_after_garbage_windows_is_found() {
        let mut framer = NalFramer::default();
        framer.extract_units(&[0xAB, 0xAB, 0x00]);
        framer.extract_units(&[0xAB, 0x00, 0x00]);
        assert!(framer.extract_units(&[0x00, 0x01, 0x67, 0x42]).is_empty());
        assert_eq!(framer.buffered(), &[0, 0, 0, 1, 0x67, 0x42]);
        let units = framer.extract_units(&[0, 0, 1, 0x68]);
        assert_eq!(payloads(&units), vec![vec![0x67, 0x42]]);
    }

    #[test]
    fn long_unit_is_delivered_intact_across_many_windows() {
        let mut framer = NalFramer::default();
        assert!(framer.extract_units(&[0, 0, 0, 1]).is_empty());
        for _ in 0..64 {
            assert!(framer.extract_units(&[0x41; 512]).is_empty());
        }
        // Trailing zero of the payload precedes a 4-byte code split across calls.
        framer.extract_units(&[0x00, 0x00]);
        let units = framer.extract_units(&[0x00, 0x01, 0x65]);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].payload.len(), 64 * 512);
        assert_eq!(framer.buffered(), &[0, 0, 0, 1, 0x65]);
    }

    #[test]
    fn round_trip_preserves_payload_bytes() {
        let nals: Vec<Vec<u8>> = vec![
            vec![0x67, 0x42, 0x00, 0x1e],
            vec![0x68, 0xce, 0x38, 0x80],
            (0..=255u8).filter(|b| *b != 0).cycle().take(3000).collect(),
            vec![0x41, 0x9a, 0x02],
        ];
        let mut stream = Vec::new();
        for (i, nal) in nals.iter().enumerate() {
            if i % 2 == 0 {
                stream.extend_from_slice(&START_CODE_4);
            } else {
                stream.extend_from_slice(&START_CODE_3);
            }
            stream.extend_from_slice(nal);
        }

        // Feed in odd-sized windows so units straddle chunk boundaries.
        let mut framer = NalFramer::default();
        let mut units = Vec::new();
        for chunk in stream.chunks(777) {
            units.extend(framer.extract_units(chunk));
        }
        units.extend(framer.finish());
        assert_eq!(payloads(&units), nals);

        // Re-bracket and frame again: identical payloads.
        let rebuilt: Vec<u8> = units
            .iter()
            .flat_map(|u| START_CODE_4.iter().chain(u.payload.iter()).copied())
            .collect();
        let mut again = NalFramer::default();
        let mut reframed = again.extract_units(&rebuilt);
        reframed.extend(again.finish());
        assert_eq!(payloads(&reframed), nals);
    }
}
