//! Synthetic RTP media-traffic generator.
//!
//! Drives a media server through its control plane and streams paced
//! audio (PCMA) or video (H.264) RTP from files held in memory, over UDP
//! or RFC 4571 framed TCP.
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use loadgen::{
//!     ControlPlane, Generator, LoadgenConfig, LoopbackControlPlane, MediaCache, MediaKind,
//!     MediaLibrary, SessionSpec,
//! };
//!
//! # fn main() -> loadgen::Result<()> {
//! let media = MediaLibrary::default().with_audio(MediaCache::load("audio.alaw")?);
//! let generator = Generator::new(LoadgenConfig::default(), media);
//! let control: Arc<dyn ControlPlane> =
//!     Arc::new(LoopbackControlPlane::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
//!
//! let spec = SessionSpec::new("gen-1", MediaKind::Audio).run_time(Duration::from_secs(3));
//! let report = generator.run_session(&control, &spec)?;
//! println!("{} packets sent", report.packets);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod media;
pub mod pacer;
pub mod pool;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use config::LoadgenConfig;
pub use control::{ControlPlane, LoopbackControlPlane};
pub use error::{LoadgenError, Result, SessionStage};
pub use media::{MediaCache, MediaKind, MediaLibrary, Packetizer};
pub use pool::PortPool;
pub use session::{FailurePolicy, Generator, SessionReport, SessionSpec, SessionState};
pub use transport::{BackendKind, RtpBackend};
