use serde::Deserialize;

use super::{CodecType, FramedUnit, Packetizer, RtpFragment};

pub const DEFAULT_MTU: usize = 1200;

/// How NAL units larger than the MTU are carried (RFC 6184 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacketizationMode {
    /// Mode 0: every NAL unit goes out as-is in one packet, whatever its
    /// size.
    SingleNal,
    /// Mode 1: oversized NAL units are split into FU-A fragments.
    NonInterleaved,
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts NAL units (start codes already stripped by
/// [`NalFramer`](super::annexb::NalFramer)) into RTP payloads:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the MTU are sent
///   as-is in a single RTP packet.
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the MTU are split
///   across multiple RTP packets. Each fragment carries a 2-byte FU
///   header (FU indicator + FU header) before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
/// Every fragment of a unit shares the unit's timestamp. The marker bit
/// is set on the last fragment only.
#[derive(Debug)]
pub struct H264Packetizer {
    payload_type: u8,
    mtu: usize,
    mode: PacketizationMode,
}

impl H264Packetizer {
    pub fn new(payload_type: u8, mtu: usize, mode: PacketizationMode) -> Self {
        Self {
            payload_type,
            mtu: mtu.max(3),
            mode,
        }
    }

    /// Split one NAL unit into RTP payloads.
    pub fn packetize_nal(&self, nal_unit: Vec<u8>, timestamp: u32) -> Vec<RtpFragment> {
        if nal_unit.is_empty() {
            return Vec::new();
        }

        if nal_unit.len() <= self.mtu || self.mode == PacketizationMode::SingleNal {
            if nal_unit.len() > self.mtu {
                tracing::trace!(nal_size = nal_unit.len(), mtu = self.mtu, "oversized NAL sent whole");
            }
            return vec![self.fragment(nal_unit, timestamp, true)];
        }

        // FU-A fragmentation (RFC 6184 §5.8)
        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        let nri = nal_header & 0x60;

        // FU indicator: NRI from original NAL, type = 28 (FU-A)
        let fu_indicator = nri | 28;
        let payload = &nal_unit[1..];

        let max_fragment = self.mtu - 2;
        let mut fragments = Vec::with_capacity(payload.len().div_ceil(max_fragment));
        let mut offset = 0usize;

        while offset < payload.len() {
            let chunk_size = max_fragment.min(payload.len() - offset);
            let first = offset == 0;
            let last = offset + chunk_size == payload.len();

            // FU header: S=start, E=end, R=0, Type=original NAL type
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last { 0x40 } else { 0x00 };

            let mut data = Vec::with_capacity(2 + chunk_size);
            data.push(fu_indicator);
            data.push(start_bit | end_bit | nal_type);
            data.extend_from_slice(&payload[offset..offset + chunk_size]);
            fragments.push(self.fragment(data, timestamp, last));

            offset += chunk_size;
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = fragments.len(),
            "FU-A fragmented NAL unit"
        );

        fragments
    }

    fn fragment(&self, payload: Vec<u8>, timestamp: u32, marker: bool) -> RtpFragment {
        RtpFragment {
            payload,
            payload_type: self.payload_type,
            timestamp,
            marker,
        }
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, unit: FramedUnit) -> Vec<RtpFragment> {
        match unit {
            FramedUnit::Nal(nal) => self.packetize_nal(nal.payload, nal.timestamp),
            FramedUnit::Audio(_) => {
                tracing::warn!("H.264 packetizer received an audio unit");
                Vec::new()
            }
        }
    }

    fn codec(&self) -> CodecType {
        CodecType::H264
    }

    fn payload_type(&self) -> u8 {
        self.payload_type
    }
}
