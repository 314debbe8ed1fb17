/// RTP fixed header writer (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The header owns only the per-stream state: the SSRC and the 16-bit
/// wrapping sequence number. Payload type, timestamp and marker are
/// supplied per packet by the caller, since the generator stamps each
/// framed unit itself.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

pub const RTP_HEADER_LEN: usize = 12;

impl RtpHeader {
    /// Create header state with explicit SSRC.
    pub fn new(ssrc: u32) -> Self {
        tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "RTP header state created");
        Self { ssrc, sequence: 0 }
    }

    /// Create with a random SSRC.
    ///
    /// Per RFC 3550 §8.1, the SSRC should be chosen randomly to minimize
    /// the probability of collisions between independent sessions.
    pub fn with_random_ssrc() -> Self {
        Self::new(rand::random::<u32>())
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    pub fn write(&mut self, marker: bool, payload_type: u8, timestamp: u32) -> [u8; RTP_HEADER_LEN] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | (payload_type & 0x7f);

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}
