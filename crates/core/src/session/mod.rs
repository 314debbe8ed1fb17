//! Session orchestration.
//!
//! A [`Generator`] owns everything sessions share (configuration, the
//! [`PortPool`], the frozen [`MediaLibrary`] and the active-session gauge)
//! and drives each session through its lifecycle:
//!
//! ```text
//! Idle        register, lease peer port, prepare, lease local port,
//!   |         update, start, keepalive task, settle, open backend
//! Negotiated
//!   |         packet pump, SESSION_INFO task, pacer, record action
//! Streaming
//!   |         run time elapsed / generator shutdown / pump fault
//! Draining    stop pacer, grace period, stop pump (closes transport)
//!   |
//! Closed      record stop, StopSession, linger, stop tasks, release ports
//! ```
//!
//! Each role runs on its own named thread. Threads are joined before a
//! session returns, and ports are held in [`PortLease`]s, so every exit
//! path leaves the pool and the gauge as it found them.

mod fleet;
mod periodic;
mod pump;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::select;

use crate::config::LoadgenConfig;
use crate::control::{
    CodecInfo, ControlPlane, PrepareRequest, PreparedSession, RECORD_COMMAND, RECORD_START,
    RECORD_STOP, SystemEvent,
};
use crate::error::{LoadgenError, Result, SessionStage};
use crate::media::audio::AudioPacketizer;
use crate::media::h264::H264Packetizer;
use crate::media::{CodecType, MediaCache, MediaKind, MediaLibrary, Packetizer};
use crate::pacer::{Pacer, PacerStats};
use crate::pool::{PortLease, PortPool};
use crate::shutdown::Shutdown;
use crate::transport::{BackendKind, CodecProfile, RtpBackend};

pub use fleet::FailurePolicy;
use periodic::Periodic;
use pump::{PacketPump, PumpStats};

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Control plane agreed on the session and the transport is open.
    Negotiated,
    Streaming,
    /// Reading has stopped; in-flight units are being flushed.
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiated => "negotiated",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Tracks and logs the state of one session.
struct Lifecycle {
    label: String,
    state: SessionState,
}

impl Lifecycle {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: SessionState::Idle,
        }
    }

    fn advance(&mut self, next: SessionState) {
        tracing::debug!(session = %self.label, old_state = %self.state, new_state = %next, "state transition");
        self.state = next;
    }
}

/// What one session streams and how.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Identity announced on the signaling channel.
    pub instance_id: String,
    pub media: MediaKind,
    /// Media graph description passed to `prepare_session`.
    pub graph_desc: String,
    /// Time spent streaming before the session drains.
    pub run_time: Duration,
    /// Replay the media from the start once it runs out.
    pub looping: bool,
    pub backend: BackendKind,
    /// Toggle the server-side file sink around the stream.
    pub record: bool,
}

impl SessionSpec {
    pub fn new(instance_id: impl Into<String>, media: MediaKind) -> Self {
        Self {
            instance_id: instance_id.into(),
            media,
            graph_desc: String::new(),
            run_time: Duration::from_secs(10),
            looping: false,
            backend: BackendKind::Udp,
            record: false,
        }
    }

    pub fn run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn graph(mut self, graph_desc: impl Into<String>) -> Self {
        self.graph_desc = graph_desc.into();
        self
    }

    pub fn record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }
}

/// Outcome of a session that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: String,
    pub instance_id: String,
    /// Units produced by the pacer.
    pub units_framed: u64,
    /// Units handed to the backend.
    pub units_sent: u64,
    pub packets: u64,
    pub bytes: u64,
    pub write_failures: u64,
    /// Completed passes over the media cache.
    pub passes: u64,
}

/// Holds one slot of the active-session gauge.
struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
    label: String,
}

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, label: &str) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(session = %label, active_sessions = now, "session streaming");
        Self {
            active,
            label: label.to_string(),
        }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let now = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::info!(session = %self.label, active_sessions = now, "session finished");
    }
}

/// State a session holds between negotiation and teardown.
struct Negotiated {
    prepared: PreparedSession,
    backend: Box<dyn RtpBackend>,
    keepalive: Periodic,
    _peer_port: PortLease,
    _local_port: PortLease,
}

/// Running pacer and pump of one session.
struct Streaming {
    pacer_stop: Shutdown,
    pacer: JoinHandle<PacerStats>,
    pump_stop: Shutdown,
    pump: JoinHandle<(PumpStats, Result<()>)>,
    fault: Arc<Shutdown>,
}

/// Runs synthetic media sessions against a media server.
pub struct Generator {
    config: LoadgenConfig,
    pool: Arc<PortPool>,
    media: MediaLibrary,
    active: AtomicUsize,
    shutdown: Shutdown,
}

impl Generator {
    /// Build a generator with a port pool covering the configured range.
    pub fn new(config: LoadgenConfig, media: MediaLibrary) -> Self {
        let pool = Arc::new(PortPool::new(config.port_start, config.port_end));
        Self::with_pool(config, media, pool)
    }

    /// Build a generator that allocates from an existing pool.
    pub fn with_pool(config: LoadgenConfig, media: MediaLibrary, pool: Arc<PortPool>) -> Self {
        Self {
            config,
            pool,
            media,
            active: AtomicUsize::new(0),
            shutdown: Shutdown::new(),
        }
    }

    pub fn config(&self) -> &LoadgenConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Number of sessions currently between Streaming and Closed.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Move every streaming session to Draining and refuse new ones.
    ///
    /// One-shot: a generator cannot be restarted after shutdown.
    pub fn shutdown(&self) {
        if !self.shutdown.is_triggered() {
            tracing::info!(active_sessions = self.active_sessions(), "generator shutdown requested");
        }
        self.shutdown.trigger();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Negotiate one session with `control`, stream for `spec.run_time`
    /// and tear it down.
    pub fn run_session(&self, control: &Arc<dyn ControlPlane>, spec: &SessionSpec) -> Result<SessionReport> {
        let mut lifecycle = Lifecycle::new(&spec.instance_id);

        let (negotiated, cache) = self
            .negotiate(control, spec, &mut lifecycle)
            .map_err(|e| session_failed(&lifecycle.label, SessionStage::Negotiation, e))?;
        lifecycle.advance(SessionState::Negotiated);

        let session_id = negotiated.prepared.session_id.clone();
        let report_task = if self.config.report_session_info {
            let control = Arc::clone(control);
            let session_id = session_id.clone();
            match Periodic::spawn(format!("report-{session_id}"), self.config.report_interval(), move || {
                control.send_event(SystemEvent::SessionInfo {
                    session_id: session_id.clone(),
                })
            }) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!(session = %lifecycle.label, error = %e, "SESSION_INFO task not started");
                    None
                }
            }
        } else {
            None
        };

        let recording = spec.record
            && match control.execute_action(&session_id, RECORD_COMMAND, RECORD_START) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(session = %lifecycle.label, error = %e, "recording start failed");
                    false
                }
            };

        let mut active = None;
        let streamed = self.stream(negotiated.backend, cache, spec, &mut lifecycle, &mut active);

        if recording {
            if let Err(e) = control.execute_action(&session_id, RECORD_COMMAND, RECORD_STOP) {
                tracing::warn!(session = %lifecycle.label, error = %e, "recording stop failed");
            }
        }
        let stopped = control.stop_session(&session_id);
        thread::sleep(self.config.stop_linger());
        drop(active);

        let keepalives = negotiated.keepalive.finish();
        let reports = report_task.map_or(0, Periodic::finish);
        tracing::debug!(session = %lifecycle.label, keepalives, reports, "session tasks stopped");
        lifecycle.advance(SessionState::Closed);

        let mut report = streamed.map_err(|e| session_failed(&lifecycle.label, SessionStage::Streaming, e))?;
        stopped.map_err(|e| session_failed(&lifecycle.label, SessionStage::Streaming, e))?;
        report.session_id = session_id;
        report.instance_id = spec.instance_id.clone();
        tracing::info!(
            session = %lifecycle.label,
            packets = report.packets,
            bytes = report.bytes,
            "session closed"
        );
        Ok(report)
    }

    /// Stream a session's media straight to `remote` without any
    /// control-plane calls.
    pub fn send_direct(&self, spec: &SessionSpec, remote: SocketAddr) -> Result<SessionReport> {
        let mut lifecycle = Lifecycle::new(&spec.instance_id);
        let negotiate = || -> Result<_> {
            if self.shutdown.is_triggered() {
                return Err(LoadgenError::Cancelled);
            }
            let cache = self.media.get(spec.media)?.clone();
            let local_port = self.pool.lease()?;
            let local = SocketAddr::new(self.config.local_ip, local_port.port());
            let backend = self.open_backend(spec, local, remote)?;
            Ok((cache, local_port, backend))
        };
        let (cache, _local_port, backend) =
            negotiate().map_err(|e| session_failed(&lifecycle.label, SessionStage::Negotiation, e))?;
        lifecycle.advance(SessionState::Negotiated);
        tracing::info!(session = %lifecycle.label, %remote, backend = %spec.backend, "direct stream opened");

        let mut active = None;
        let streamed = self.stream(backend, cache, spec, &mut lifecycle, &mut active);
        drop(active);
        lifecycle.advance(SessionState::Closed);

        let mut report = streamed.map_err(|e| session_failed(&lifecycle.label, SessionStage::Streaming, e))?;
        report.session_id = lifecycle.label.clone();
        report.instance_id = spec.instance_id.clone();
        Ok(report)
    }

    /// Idle → Negotiated. On failure after `prepare_session`, the server
    /// side is stopped again; leases and tasks are released by drop.
    fn negotiate(
        &self,
        control: &Arc<dyn ControlPlane>,
        spec: &SessionSpec,
        lifecycle: &mut Lifecycle,
    ) -> Result<(Negotiated, MediaCache)> {
        if self.shutdown.is_triggered() {
            return Err(LoadgenError::Cancelled);
        }
        let cache = self.media.get(spec.media)?.clone();

        control.register(&spec.instance_id)?;
        let peer_port = self.pool.lease()?;
        let request = PrepareRequest {
            peer_ip: self.config.local_ip,
            peer_port: peer_port.port(),
            codecs: vec![CodecInfo::for_kind(spec.media, self.payload_type(spec.media))],
            graph_desc: spec.graph_desc.clone(),
            instance_id: spec.instance_id.clone(),
        };
        let prepared = control.prepare_session(&request)?;
        lifecycle.label = prepared.session_id.clone();
        tracing::info!(
            session = %lifecycle.label,
            instance_id = %spec.instance_id,
            media = %spec.media,
            remote = %SocketAddr::new(prepared.local_ip, prepared.local_rtp_port),
            "session prepared"
        );

        match self.attach(control, spec, &prepared) {
            Ok((local_port, keepalive, backend)) => Ok((
                Negotiated {
                    prepared,
                    backend,
                    keepalive,
                    _peer_port: peer_port,
                    _local_port: local_port,
                },
                cache,
            )),
            Err(e) => {
                if let Err(stop_err) = control.stop_session(&prepared.session_id) {
                    tracing::warn!(session = %lifecycle.label, error = %stop_err, "rollback stop failed");
                }
                Err(e)
            }
        }
    }

    fn attach(
        &self,
        control: &Arc<dyn ControlPlane>,
        spec: &SessionSpec,
        prepared: &PreparedSession,
    ) -> Result<(PortLease, Periodic, Box<dyn RtpBackend>)> {
        let session_id = prepared.session_id.as_str();
        let local_port = self.pool.lease()?;
        control.update_session(session_id, local_port.port())?;
        control.start_session(session_id)?;

        let keepalive = {
            let control = Arc::clone(control);
            let instance_id = spec.instance_id.clone();
            Periodic::spawn(format!("keepalive-{session_id}"), self.config.keepalive_interval(), move || {
                control.send_event(SystemEvent::Keepalive {
                    instance_id: instance_id.clone(),
                })
            })?
        };

        self.shutdown.signal().wait_timeout(self.config.settle_delay());

        let local = SocketAddr::new(self.config.local_ip, local_port.port());
        let remote = SocketAddr::new(prepared.local_ip, prepared.local_rtp_port);
        let backend = self.open_backend(spec, local, remote)?;
        Ok((local_port, keepalive, backend))
    }

    /// Negotiated → Streaming → Draining. Returns once the pacer and
    /// pump threads are joined and the transport is closed.
    ///
    /// The gauge slot is handed back through `active` so the caller keeps
    /// the session counted until it is closed.
    fn stream<'a>(
        &'a self,
        backend: Box<dyn RtpBackend>,
        cache: MediaCache,
        spec: &SessionSpec,
        lifecycle: &mut Lifecycle,
        active: &mut Option<ActiveGuard<'a>>,
    ) -> Result<SessionReport> {
        let streaming = self.start_streaming(backend, cache, spec, &lifecycle.label)?;
        *active = Some(ActiveGuard::enter(&self.active, &lifecycle.label));
        lifecycle.advance(SessionState::Streaming);

        let deadline = crossbeam_channel::after(spec.run_time);
        let stop = self.shutdown.signal();
        let fault = streaming.fault.signal();
        select! {
            recv(deadline) -> _ => {
                tracing::debug!(session = %lifecycle.label, "run time elapsed");
            }
            recv(stop.receiver()) -> _ => {
                tracing::info!(session = %lifecycle.label, "draining on generator shutdown");
            }
            recv(fault.receiver()) -> _ => {
                tracing::warn!(session = %lifecycle.label, "draining after transport fault");
            }
        }
        lifecycle.advance(SessionState::Draining);

        streaming.pacer_stop.trigger();
        let pacer_stats = join_worker(streaming.pacer, &lifecycle.label, "pacer")?;
        fault.wait_timeout(self.config.drain_grace());
        streaming.pump_stop.trigger();
        let (pump_stats, pumped) = join_worker(streaming.pump, &lifecycle.label, "pump")?;
        pumped?;

        Ok(SessionReport {
            units_framed: pacer_stats.units,
            units_sent: pump_stats.units,
            packets: pump_stats.packets,
            bytes: pump_stats.bytes,
            write_failures: pump_stats.write_failures,
            passes: pacer_stats.passes,
            ..SessionReport::default()
        })
    }

    fn start_streaming(
        &self,
        backend: Box<dyn RtpBackend>,
        cache: MediaCache,
        spec: &SessionSpec,
        label: &str,
    ) -> Result<Streaming> {
        let (tx, rx) = crossbeam_channel::bounded(self.config.queue_capacity.max(1));
        let fault = Arc::new(Shutdown::new());

        let pump_stop = Shutdown::new();
        let pump = {
            let pump = PacketPump::new(
                label.to_string(),
                backend,
                self.packetizer(spec.media),
                self.config.max_write_failures,
            );
            let stop = pump_stop.signal();
            let fault = Arc::clone(&fault);
            thread::Builder::new()
                .name(format!("pump-{label}"))
                .spawn(move || pump.run(rx, stop, &fault))?
        };

        let pacer_stop = Shutdown::new();
        let pacer = {
            let mut pacer = Pacer::for_kind(spec.media, cache, &self.config);
            if spec.looping {
                pacer = pacer.looping(self.config.loop_pause());
            }
            let stop = pacer_stop.signal();
            thread::Builder::new()
                .name(format!("pacer-{label}"))
                .spawn(move || pacer.run(tx, stop))?
        };

        Ok(Streaming {
            pacer_stop,
            pacer,
            pump_stop,
            pump,
            fault,
        })
    }

    fn open_backend(&self, spec: &SessionSpec, local: SocketAddr, remote: SocketAddr) -> Result<Box<dyn RtpBackend>> {
        let mut backend = spec.backend.open();
        let stream = backend.create_outbound_stream(local)?;
        backend.set_profile(stream, &self.profile(spec.media))?;
        backend.add_remote(remote)?;
        backend.start()?;
        Ok(backend)
    }

    fn payload_type(&self, media: MediaKind) -> u8 {
        match media {
            MediaKind::Audio => self.config.audio.payload_type,
            MediaKind::Video => self.config.video.payload_type,
        }
    }

    fn profile(&self, media: MediaKind) -> CodecProfile {
        let codec = match media {
            MediaKind::Audio => CodecType::PcmAlaw,
            MediaKind::Video => CodecType::H264,
        };
        CodecProfile {
            codec,
            payload_type: self.payload_type(media),
        }
    }

    fn packetizer(&self, media: MediaKind) -> Box<dyn Packetizer> {
        match media {
            MediaKind::Audio => Box::new(AudioPacketizer::new(
                self.config.audio.payload_type,
                self.config.audio.timestamp_step,
            )),
            MediaKind::Video => Box::new(H264Packetizer::new(
                self.config.video.payload_type,
                self.config.video.mtu,
                self.config.video.packetization,
            )),
        }
    }
}

fn session_failed(session: &str, stage: SessionStage, source: LoadgenError) -> LoadgenError {
    tracing::warn!(session, %stage, error = %source, "session failed");
    LoadgenError::SessionFailed {
        session: session.to_string(),
        stage,
        source: Box::new(source),
    }
}

fn join_worker<T>(handle: JoinHandle<T>, session: &str, role: &str) -> Result<T> {
    handle.join().map_err(|_| {
        tracing::warn!(session, role, "session worker panicked");
        LoadgenError::Io(std::io::Error::other(format!("{role} thread panicked")))
    })
}
