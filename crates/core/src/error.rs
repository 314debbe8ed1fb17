//! Error types for the traffic generator.

use std::fmt;
use std::path::PathBuf;

use crate::media::MediaKind;

/// Errors that can occur while generating media traffic.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Resources**: [`PortExhausted`](Self::PortExhausted): the port pool
///   is empty; the session must abort setup.
/// - **Media**: [`MediaLoad`](Self::MediaLoad),
///   [`MediaMissing`](Self::MediaMissing).
/// - **Control plane**: [`ControlPlane`](Self::ControlPlane): a remote
///   call was rejected or could not be delivered.
/// - **Transport**: [`Io`](Self::Io),
///   [`TransportNotConfigured`](Self::TransportNotConfigured),
///   [`StreamAlreadyCreated`](Self::StreamAlreadyCreated),
///   [`RemoteNotSet`](Self::RemoteNotSet),
///   [`WriteFailed`](Self::WriteFailed).
/// - **Lifecycle**: [`Cancelled`](Self::Cancelled),
///   [`Config`](Self::Config).
/// - **Session**: [`SessionFailed`](Self::SessionFailed) wraps any of the
///   above with the lifecycle stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum LoadgenError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The [`PortPool`](crate::pool::PortPool) has no free port left.
    #[error("port pool exhausted")]
    PortExhausted,

    /// A media file could not be read into the cache.
    #[error("failed to load media file {}: {source}", path.display())]
    MediaLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A session asked for media that was never loaded.
    #[error("no {0} media loaded")]
    MediaMissing(MediaKind),

    /// A control-plane call failed.
    #[error("control plane call {call} failed: {message}")]
    ControlPlane { call: &'static str, message: String },

    /// A transport operation was issued before the backend was set up.
    #[error("transport not configured: {0}")]
    TransportNotConfigured(&'static str),

    /// The backend already owns its single outbound stream.
    #[error("outbound stream already created")]
    StreamAlreadyCreated,

    /// `start` was called before a remote peer was registered.
    #[error("no remote peer registered")]
    RemoteNotSet,

    /// Too many consecutive packet writes failed.
    #[error("transport write failed {failures} times in a row")]
    WriteFailed { failures: u32 },

    /// The generator was shut down before the session could start.
    #[error("generator shut down")]
    Cancelled,

    /// Configuration file could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A session failed; `stage` tells whether it never got going or broke
    /// while streaming.
    #[error("session {session} failed during {stage}: {source}")]
    SessionFailed {
        session: String,
        stage: SessionStage,
        #[source]
        source: Box<LoadgenError>,
    },
}

impl LoadgenError {
    pub(crate) fn control(call: &'static str, message: impl fmt::Display) -> Self {
        Self::ControlPlane {
            call,
            message: message.to_string(),
        }
    }

    /// Stage of a [`SessionFailed`](Self::SessionFailed) error, if any.
    pub fn stage(&self) -> Option<SessionStage> {
        match self {
            Self::SessionFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Which half of the session lifecycle an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    /// Port allocation, control-plane negotiation or transport setup.
    Negotiation,
    /// Packet emission after the session started streaming.
    Streaming,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiation => write!(f, "negotiation"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// Convenience alias for `Result<T, LoadgenError>`.
pub type Result<T> = std::result::Result<T, LoadgenError>;
