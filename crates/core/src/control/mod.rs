//! Signaling contract with the remote media server.
//!
//! A session negotiates through these calls, in order:
//!
//! ```text
//! register           -> REGISTER event on the signaling channel
//! prepare_session    -> server allocates a session and an RTP receive port
//! update_session     -> tell the server which port we send from
//! start_session      -> server starts its media graph
//! execute_action     -> optional commands (recording)
//! stop_session       -> teardown
//! ```
//!
//! Periodic KEEPALIVE and SESSION_INFO events travel through
//! [`ControlPlane::send_event`].

pub mod loopback;

use std::fmt;
use std::net::IpAddr;

use crate::error::Result;
use crate::media::{CodecType, MediaKind};

pub use loopback::{ControlCall, LoopbackControlPlane, SinkStats};

/// `execute_action` command used for recording control.
pub const RECORD_COMMAND: &str = "exec";
/// Starts the server-side H.264 file sink.
pub const RECORD_START: &str = "[h264_file_sink] <-> 'play'";
/// Stops the server-side H.264 file sink.
pub const RECORD_STOP: &str = "[h264_file_sink] <-> 'stop'";

/// Codec offered in `prepare_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub payload_number: u8,
    pub codec: CodecType,
    /// Free-form format parameters, empty for the synthetic streams.
    pub codec_param: String,
}

impl CodecInfo {
    pub fn new(codec: CodecType, payload_number: u8) -> Self {
        Self {
            payload_number,
            codec,
            codec_param: String::new(),
        }
    }

    /// Codec matching a session's media kind.
    pub fn for_kind(kind: MediaKind, payload_number: u8) -> Self {
        match kind {
            MediaKind::Audio => Self::new(CodecType::PcmAlaw, payload_number),
            MediaKind::Video => Self::new(CodecType::H264, payload_number),
        }
    }
}

/// Arguments of `prepare_session`.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    /// Address the server should expect media from.
    pub peer_ip: IpAddr,
    pub peer_port: u16,
    pub codecs: Vec<CodecInfo>,
    /// Media graph description handed to the server verbatim.
    pub graph_desc: String,
    pub instance_id: String,
}

/// Reply of `prepare_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSession {
    pub session_id: String,
    /// Address the server receives RTP on.
    pub local_ip: IpAddr,
    pub local_rtp_port: u16,
}

/// Out-of-band events sent on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    Register { instance_id: String },
    Keepalive { instance_id: String },
    SessionInfo { session_id: String },
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { .. } => write!(f, "REGISTER"),
            Self::Keepalive { .. } => write!(f, "KEEPALIVE"),
            Self::SessionInfo { .. } => write!(f, "SESSION_INFO"),
        }
    }
}

/// Remote media server as seen by a session.
///
/// Implementations are shared by every session of a fleet, hence
/// `Send + Sync` and `&self` receivers.
pub trait ControlPlane: Send + Sync {
    /// Announce this instance on the signaling channel.
    fn register(&self, instance_id: &str) -> Result<()> {
        self.send_event(SystemEvent::Register {
            instance_id: instance_id.to_string(),
        })
    }

    fn prepare_session(&self, request: &PrepareRequest) -> Result<PreparedSession>;

    /// Report the local port media will be sent from.
    fn update_session(&self, session_id: &str, peer_port: u16) -> Result<()>;

    fn start_session(&self, session_id: &str) -> Result<()>;

    fn stop_session(&self, session_id: &str) -> Result<()>;

    fn execute_action(&self, session_id: &str, cmd: &str, cmd_arg: &str) -> Result<()>;

    fn send_event(&self, event: SystemEvent) -> Result<()>;
}
