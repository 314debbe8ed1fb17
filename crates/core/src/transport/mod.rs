//! RTP session backends.
//!
//! The session orchestrator talks to the network only through the
//! [`RtpBackend`] capability set. Two interchangeable backends implement it:
//!
//! - **UDP** ([`udp`]): one RTP packet per datagram (RFC 3550).
//! - **TCP** ([`tcp`]): RTP packets on a connected stream, each prefixed
//!   with its 16-bit length (RFC 4571).
//!
//! Both stage packets the same way through [`OutboundStream`]; they only
//! differ in how a finished packet reaches the peer.

pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{LoadgenError, Result};
use crate::media::rtp::{RTP_HEADER_LEN, RtpHeader};
use crate::media::{CodecType, RtpFragment};

pub use tcp::TcpBackend;
pub use udp::UdpBackend;

/// Handle of an outbound stream inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(pub u32);

/// Codec assignment for an outbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecProfile {
    pub codec: CodecType,
    pub payload_type: u8,
}

/// Selects which backend a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Udp,
    Tcp,
}

impl BackendKind {
    /// Instantiate a fresh, unconfigured backend of this kind.
    pub fn open(self) -> Box<dyn RtpBackend> {
        match self {
            Self::Udp => Box::new(UdpBackend::new()),
            Self::Tcp => Box::new(TcpBackend::new()),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!("unknown RTP backend '{other}' (expected udp or tcp)")),
        }
    }
}

/// Uniform capability set of an RTP session implementation.
///
/// Call order: [`create_outbound_stream`](Self::create_outbound_stream),
/// [`set_profile`](Self::set_profile), [`add_remote`](Self::add_remote),
/// [`start`](Self::start); then per packet [`new_packet`](Self::new_packet),
/// the `set_*` stagers and [`write`](Self::write); finally
/// [`close`](Self::close).
pub trait RtpBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Allocate the backend's single outbound stream, sending from `local`.
    fn create_outbound_stream(&mut self, local: SocketAddr) -> Result<StreamId>;

    /// Register the remote peer packets are sent to.
    fn add_remote(&mut self, remote: SocketAddr) -> Result<()>;

    /// Bind or connect the underlying socket.
    fn start(&mut self) -> Result<()>;

    /// Serialize the staged packet and send it. Returns bytes written.
    fn write(&mut self) -> Result<usize>;

    /// Release the socket. Further writes fail.
    fn close(&mut self);

    /// The staging stream, once created.
    fn outbound(&mut self) -> Option<&mut OutboundStream>;

    fn set_profile(&mut self, stream: StreamId, profile: &CodecProfile) -> Result<()> {
        let out = self
            .outbound()
            .ok_or(LoadgenError::TransportNotConfigured("set_profile before stream creation"))?;
        if out.id != stream {
            return Err(LoadgenError::TransportNotConfigured("unknown stream id"));
        }
        out.set_profile(profile.clone());
        Ok(())
    }

    /// Begin staging a packet carrying `timestamp`.
    fn new_packet(&mut self, timestamp: u32) {
        if let Some(out) = self.outbound() {
            out.new_packet(timestamp);
        }
    }

    fn set_payload(&mut self, payload: &[u8]) {
        if let Some(out) = self.outbound() {
            out.staged.payload.clear();
            out.staged.payload.extend_from_slice(payload);
        }
    }

    fn set_marker(&mut self, marker: bool) {
        if let Some(out) = self.outbound() {
            out.staged.marker = marker;
        }
    }

    fn set_payload_type(&mut self, payload_type: u8) {
        if let Some(out) = self.outbound() {
            out.staged.payload_type = payload_type;
        }
    }

    /// Stage and write one packetizer fragment.
    fn send_fragment(&mut self, fragment: &RtpFragment) -> Result<usize> {
        self.new_packet(fragment.timestamp);
        self.set_payload_type(fragment.payload_type);
        self.set_marker(fragment.marker);
        self.set_payload(&fragment.payload);
        self.write()
    }
}

#[derive(Debug, Default)]
struct StagedPacket {
    timestamp: u32,
    payload_type: u8,
    marker: bool,
    payload: Vec<u8>,
}

/// Per-stream RTP state shared by both backends.
#[derive(Debug)]
pub struct OutboundStream {
    id: StreamId,
    local: SocketAddr,
    header: RtpHeader,
    profile: Option<CodecProfile>,
    staged: StagedPacket,
}

impl OutboundStream {
    pub fn new(id: StreamId, local: SocketAddr) -> Self {
        Self {
            id,
            local,
            header: RtpHeader::with_random_ssrc(),
            profile: None,
            staged: StagedPacket::default(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    fn set_profile(&mut self, profile: CodecProfile) {
        tracing::debug!(
            codec = profile.codec.name(),
            clock_rate = profile.codec.clock_rate(),
            pt = profile.payload_type,
            ssrc = format_args!("{:#010X}", self.header.ssrc),
            "stream profile set"
        );
        self.staged.payload_type = profile.payload_type;
        self.profile = Some(profile);
    }

    fn new_packet(&mut self, timestamp: u32) {
        self.staged.timestamp = timestamp;
        self.staged.marker = false;
        self.staged.payload.clear();
        if let Some(profile) = &self.profile {
            self.staged.payload_type = profile.payload_type;
        }
    }

    /// Serialize the staged packet into `buf` (cleared first) and advance
    /// the sequence number.
    pub fn serialize_into(&mut self, buf: &mut Vec<u8>) {
        let staged = &self.staged;
        let header = self
            .header
            .write(staged.marker, staged.payload_type, staged.timestamp);
        buf.clear();
        buf.reserve(RTP_HEADER_LEN + staged.payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&staged.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses() {
        assert_eq!("udp".parse::<BackendKind>(), Ok(BackendKind::Udp));
        assert_eq!("TCP".parse::<BackendKind>(), Ok(BackendKind::Tcp));
        assert!("sctp".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Tcp.open().kind(), BackendKind::Tcp);
    }

    #[test]
    fn staged_packet_serializes() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut out = OutboundStream::new(StreamId(0), local);
        out.set_profile(CodecProfile {
            codec: CodecType::PcmAlaw,
            payload_type: 8,
        });
        out.new_packet(320);
        out.staged.payload.extend_from_slice(&[1, 2, 3]);

        let mut buf = Vec::new();
        out.serialize_into(&mut buf);
        assert_eq!(buf.len(), RTP_HEADER_LEN + 3);
        assert_eq!(buf[1] & 0x7f, 8);
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 320);
        assert_eq!(&buf[12..], &[1, 2, 3]);

        out.new_packet(480);
        out.serialize_into(&mut buf);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 1);
        assert_eq!(buf.len(), RTP_HEADER_LEN);
    }
}
