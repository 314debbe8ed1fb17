//! In-process media server emulator.
//!
//! [`LoopbackControlPlane`] answers every control call locally. Each
//! prepared session gets an RTP sink bound on an ephemeral port that
//! accepts both plain UDP datagrams and an RFC 4571 framed TCP stream, so
//! either transport backend can be pointed at it. Any call can be made to
//! fail. With [`LoopbackControlPlane::with_history`] every call and the
//! final traffic of stopped sessions are kept for inspection. Without it
//! memory stays flat however long the emulator runs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::{ControlPlane, PrepareRequest, PreparedSession, SystemEvent};
use crate::error::{LoadgenError, Result};
use crate::media::rtp::RTP_HEADER_LEN;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const BIND_ATTEMPTS: usize = 16;

/// One recorded control-plane call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Prepare {
        session_id: String,
        instance_id: String,
        peer_port: u16,
        graph_desc: String,
    },
    Update {
        session_id: String,
        peer_port: u16,
    },
    Start {
        session_id: String,
    },
    Stop {
        session_id: String,
    },
    Action {
        session_id: String,
        cmd: String,
        cmd_arg: String,
    },
    Event(SystemEvent),
}

impl ControlCall {
    /// Name of the [`ControlPlane`] method that produced this call.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prepare { .. } => "prepare_session",
            Self::Update { .. } => "update_session",
            Self::Start { .. } => "start_session",
            Self::Stop { .. } => "stop_session",
            Self::Action { .. } => "execute_action",
            Self::Event(_) => "send_event",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Prepare { session_id, .. }
            | Self::Update { session_id, .. }
            | Self::Start { session_id }
            | Self::Stop { session_id }
            | Self::Action { session_id, .. }
            | Self::Event(SystemEvent::SessionInfo { session_id }) => Some(session_id),
            Self::Event(_) => None,
        }
    }
}

/// Traffic received by a session's sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub packets: u64,
    pub bytes: u64,
    /// Largest RTP payload seen, header excluded.
    pub max_payload: usize,
    /// Packets with the marker bit set.
    pub markers: u64,
    pub payload_types: BTreeSet<u8>,
}

#[derive(Default)]
struct SinkCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
    max_payload: AtomicUsize,
    markers: AtomicU64,
    payload_types: Mutex<BTreeSet<u8>>,
}

impl SinkCounters {
    fn record(&self, packet: &[u8]) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
        self.max_payload
            .fetch_max(packet.len().saturating_sub(RTP_HEADER_LEN), Ordering::Relaxed);
        if let Some(&b1) = packet.get(1) {
            if b1 & 0x80 != 0 {
                self.markers.fetch_add(1, Ordering::Relaxed);
            }
            self.payload_types.lock().insert(b1 & 0x7f);
        }
    }

    fn snapshot(&self) -> SinkStats {
        SinkStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            max_payload: self.max_payload.load(Ordering::Relaxed),
            markers: self.markers.load(Ordering::Relaxed),
            payload_types: self.payload_types.lock().clone(),
        }
    }
}

/// UDP socket and TCP listener sharing one port, each drained by a thread.
struct Sink {
    addr: SocketAddr,
    counters: Arc<SinkCounters>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Sink {
    fn bind(ip: IpAddr, session_id: &str) -> io::Result<Self> {
        let (udp, tcp) = bind_pair(ip)?;
        let addr = udp.local_addr()?;
        udp.set_read_timeout(Some(POLL_INTERVAL))?;
        tcp.set_nonblocking(true)?;

        let counters = Arc::new(SinkCounters::default());
        let running = Arc::new(AtomicBool::new(true));

        let udp_worker = {
            let counters = counters.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("sink-udp-{session_id}"))
                .spawn(move || udp_loop(udp, &counters, &running))?
        };
        let tcp_worker = {
            let counters = counters.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("sink-tcp-{session_id}"))
                .spawn(move || tcp_loop(tcp, &counters, &running))?
        };

        Ok(Self {
            addr,
            counters,
            running,
            workers: vec![udp_worker, tcp_worker],
        })
    }

    fn stop(self) -> SinkStats {
        self.running.store(false, Ordering::SeqCst);
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::warn!(addr = %self.addr, "sink worker panicked");
            }
        }
        self.counters.snapshot()
    }
}

fn bind_pair(ip: IpAddr) -> io::Result<(UdpSocket, TcpListener)> {
    for _ in 0..BIND_ATTEMPTS {
        let udp = UdpSocket::bind((ip, 0))?;
        let port = udp.local_addr()?.port();
        match TcpListener::bind((ip, port)) {
            Ok(tcp) => return Ok((udp, tcp)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no port free for both UDP and TCP",
    ))
}

fn udp_loop(socket: UdpSocket, counters: &SinkCounters, running: &AtomicBool) {
    let mut buf = [0u8; 65536];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(n) => counters.record(&buf[..n]),
            Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => tracing::debug!(error = %e, "sink UDP receive error"),
        }
    }
}

fn tcp_loop(listener: TcpListener, counters: &SinkCounters, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((conn, peer)) => {
                tracing::debug!(%peer, "sink accepted TCP RTP stream");
                if let Err(e) = read_framed(conn, counters, running) {
                    tracing::debug!(%peer, error = %e, "sink TCP stream ended");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => tracing::warn!(error = %e, "sink TCP accept error"),
        }
    }
}

/// Split an RFC 4571 stream into RTP packets until EOF or shutdown.
fn read_framed(mut conn: TcpStream, counters: &SinkCounters, running: &AtomicBool) -> io::Result<()> {
    conn.set_nonblocking(false)?;
    conn.set_read_timeout(Some(POLL_INTERVAL))?;

    let mut pending = Vec::new();
    let mut buf = [0u8; 8192];
    while running.load(Ordering::SeqCst) {
        let n = match conn.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e),
        };
        pending.extend_from_slice(&buf[..n]);

        let mut consumed = 0;
        while let Some(header) = pending.get(consumed..consumed + 2) {
            let len = usize::from(u16::from_be_bytes([header[0], header[1]]));
            let Some(packet) = pending.get(consumed + 2..consumed + 2 + len) else {
                break;
            };
            counters.record(packet);
            consumed += 2 + len;
        }
        pending.drain(..consumed);
    }
    Ok(())
}

/// [`ControlPlane`] that emulates a media server in-process.
pub struct LoopbackControlPlane {
    ip: IpAddr,
    next_id: AtomicU64,
    history: bool,
    events: AtomicU64,
    calls: Mutex<Vec<ControlCall>>,
    failures: Mutex<HashSet<&'static str>>,
    sinks: Mutex<HashMap<String, Sink>>,
    stopped: Mutex<HashMap<String, SinkStats>>,
}

impl LoopbackControlPlane {
    /// Emulator whose sinks listen on `ip`.
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            next_id: AtomicU64::new(1),
            history: false,
            events: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashSet::new()),
            sinks: Mutex::new(HashMap::new()),
            stopped: Mutex::new(HashMap::new()),
        }
    }

    /// Keep every call and the stats of stopped sessions.
    pub fn with_history(mut self) -> Self {
        self.history = true;
        self
    }

    /// Make every future call to `call` (a [`ControlCall::name`]) fail.
    pub fn fail_on(&self, call: &'static str) {
        self.failures.lock().insert(call);
    }

    /// Every successful call so far, in order. Empty unless the emulator
    /// was built [`with_history`](Self::with_history).
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().clone()
    }

    /// Names of the calls made for one session, in order.
    pub fn calls_for(&self, session_id: &str) -> Vec<&'static str> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.session_id() == Some(session_id))
            .map(ControlCall::name)
            .collect()
    }

    /// Traffic received for a session. Stopped sessions are only kept with
    /// history enabled.
    pub fn sink_stats(&self, session_id: &str) -> Option<SinkStats> {
        if let Some(sink) = self.sinks.lock().get(session_id) {
            return Some(sink.counters.snapshot());
        }
        self.stopped.lock().get(session_id).cloned()
    }

    /// System events received, with or without history.
    pub fn events_received(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Number of sessions whose sink is still listening.
    pub fn open_sinks(&self) -> usize {
        self.sinks.lock().len()
    }

    fn check(&self, call: &'static str) -> Result<()> {
        if self.failures.lock().contains(call) {
            tracing::debug!(call, "injected control-plane failure");
            return Err(LoadgenError::control(call, "injected failure"));
        }
        Ok(())
    }

    fn require_session(&self, call: &'static str, session_id: &str) -> Result<()> {
        if self.sinks.lock().contains_key(session_id) {
            Ok(())
        } else {
            Err(LoadgenError::control(call, format!("unknown session {session_id}")))
        }
    }

    fn record(&self, call: ControlCall) {
        tracing::trace!(call = call.name(), session_id = call.session_id(), "control call");
        if self.history {
            self.calls.lock().push(call);
        }
    }
}

impl ControlPlane for LoopbackControlPlane {
    fn prepare_session(&self, request: &PrepareRequest) -> Result<PreparedSession> {
        self.check("prepare_session")?;
        let session_id = format!("{:016X}", self.next_id.fetch_add(1, Ordering::SeqCst));

        let sink = Sink::bind(self.ip, &session_id).map_err(|e| LoadgenError::control("prepare_session", e))?;
        let prepared = PreparedSession {
            session_id: session_id.clone(),
            local_ip: self.ip,
            local_rtp_port: sink.addr.port(),
        };
        tracing::debug!(
            session_id = %session_id,
            instance_id = %request.instance_id,
            sink = %sink.addr,
            codecs = request.codecs.len(),
            "loopback session prepared"
        );
        self.sinks.lock().insert(session_id.clone(), sink);

        self.record(ControlCall::Prepare {
            session_id,
            instance_id: request.instance_id.clone(),
            peer_port: request.peer_port,
            graph_desc: request.graph_desc.clone(),
        });
        Ok(prepared)
    }

    fn update_session(&self, session_id: &str, peer_port: u16) -> Result<()> {
        self.check("update_session")?;
        self.require_session("update_session", session_id)?;
        self.record(ControlCall::Update {
            session_id: session_id.to_string(),
            peer_port,
        });
        Ok(())
    }

    fn start_session(&self, session_id: &str) -> Result<()> {
        self.check("start_session")?;
        self.require_session("start_session", session_id)?;
        self.record(ControlCall::Start {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    fn stop_session(&self, session_id: &str) -> Result<()> {
        self.check("stop_session")?;
        let sink = self
            .sinks
            .lock()
            .remove(session_id)
            .ok_or_else(|| LoadgenError::control("stop_session", format!("unknown session {session_id}")))?;
        let stats = sink.stop();
        tracing::debug!(session_id, packets = stats.packets, bytes = stats.bytes, "loopback session stopped");
        if self.history {
            self.stopped.lock().insert(session_id.to_string(), stats);
        }

        self.record(ControlCall::Stop {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    fn execute_action(&self, session_id: &str, cmd: &str, cmd_arg: &str) -> Result<()> {
        self.check("execute_action")?;
        self.require_session("execute_action", session_id)?;
        self.record(ControlCall::Action {
            session_id: session_id.to_string(),
            cmd: cmd.to_string(),
            cmd_arg: cmd_arg.to_string(),
        });
        Ok(())
    }

    fn send_event(&self, event: SystemEvent) -> Result<()> {
        self.check("send_event")?;
        self.events.fetch_add(1, Ordering::Relaxed);
        self.record(ControlCall::Event(event));
        Ok(())
    }
}

impl Drop for LoopbackControlPlane {
    fn drop(&mut self) {
        for (_, sink) in self.sinks.get_mut().drain() {
            sink.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CodecInfo;
    use crate::media::MediaKind;
    use std::io::Write;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn request() -> PrepareRequest {
        PrepareRequest {
            peer_ip: LOCALHOST,
            peer_port: 20000,
            codecs: vec![CodecInfo::for_kind(MediaKind::Audio, 8)],
            graph_desc: "graph".into(),
            instance_id: "gen-1".into(),
        }
    }

    fn rtp(marker: bool, pt: u8, payload_len: usize) -> Vec<u8> {
        let mut packet = vec![0x80, if marker { 0x80 | pt } else { pt }];
        packet.resize(RTP_HEADER_LEN + payload_len, 0);
        packet
    }

    fn wait_for_packets(control: &LoopbackControlPlane, id: &str, packets: u64) -> SinkStats {
        for _ in 0..100 {
            let stats = control.sink_stats(id).unwrap();
            if stats.packets >= packets {
                return stats;
            }
            thread::sleep(Duration::from_millis(10));
        }
        control.sink_stats(id).unwrap()
    }

    #[test]
    fn session_ids_are_sequential_hex() {
        let control = LoopbackControlPlane::new(LOCALHOST).with_history();
        let a = control.prepare_session(&request()).unwrap();
        let b = control.prepare_session(&request()).unwrap();
        assert_eq!(a.session_id, "0000000000000001");
        assert_eq!(b.session_id, "0000000000000002");
        assert_ne!(a.local_rtp_port, b.local_rtp_port);
        assert_eq!(control.open_sinks(), 2);
    }

    #[test]
    fn records_calls_in_order() {
        let control = LoopbackControlPlane::new(LOCALHOST).with_history();
        control.register("gen-1").unwrap();
        let prepared = control.prepare_session(&request()).unwrap();
        let id = prepared.session_id.as_str();
        control.update_session(id, 20002).unwrap();
        control.start_session(id).unwrap();
        control
            .send_event(SystemEvent::SessionInfo {
                session_id: id.to_string(),
            })
            .unwrap();
        control.stop_session(id).unwrap();

        assert_eq!(
            control.calls_for(id),
            vec!["prepare_session", "update_session", "start_session", "send_event", "stop_session"]
        );
        assert_eq!(
            control.calls()[0],
            ControlCall::Event(SystemEvent::Register {
                instance_id: "gen-1".into()
            })
        );
        assert_eq!(control.open_sinks(), 0);
    }

    #[test]
    fn without_history_only_counts_events() {
        let control = LoopbackControlPlane::new(LOCALHOST);
        let prepared = control.prepare_session(&request()).unwrap();
        for _ in 0..100 {
            control
                .send_event(SystemEvent::Keepalive {
                    instance_id: "gen-1".into(),
                })
                .unwrap();
        }
        control.stop_session(&prepared.session_id).unwrap();

        assert_eq!(control.events_received(), 100);
        assert!(control.calls().is_empty());
        assert!(control.sink_stats(&prepared.session_id).is_none());
        assert!(control.stopped.lock().is_empty());
        assert_eq!(control.open_sinks(), 0);
    }

    #[test]
    fn unknown_session_is_rejected() {
        let control = LoopbackControlPlane::new(LOCALHOST).with_history();
        assert!(matches!(
            control.start_session("FFFF"),
            Err(LoadgenError::ControlPlane { call: "start_session", .. })
        ));
    }

    #[test]
    fn injected_failure() {
        let control = LoopbackControlPlane::new(LOCALHOST).with_history();
        control.fail_on("prepare_session");
        assert!(control.prepare_session(&request()).is_err());
        assert!(control.calls().is_empty());
        assert_eq!(control.open_sinks(), 0);
    }

    #[test]
    fn udp_sink_counts_packets() {
        let control = LoopbackControlPlane::new(LOCALHOST).with_history();
        let prepared = control.prepare_session(&request()).unwrap();
        let sender = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let target = (prepared.local_ip, prepared.local_rtp_port);
        sender.send_to(&rtp(false, 8, 160), target).unwrap();
        sender.send_to(&rtp(true, 8, 20), target).unwrap();

        let stats = wait_for_packets(&control, &prepared.session_id, 2);
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.max_payload, 160);
        assert_eq!(stats.markers, 1);
        assert_eq!(stats.payload_types, BTreeSet::from([8]));

        control.stop_session(&prepared.session_id).unwrap();
        assert_eq!(control.sink_stats(&prepared.session_id).unwrap().packets, 2);
    }

    #[test]
    fn tcp_sink_splits_framed_stream() {
        let control = LoopbackControlPlane::new(LOCALHOST).with_history();
        let prepared = control.prepare_session(&request()).unwrap();
        let mut conn = TcpStream::connect((prepared.local_ip, prepared.local_rtp_port)).unwrap();

        let mut stream = Vec::new();
        for len in [100usize, 1200, 7] {
            let packet = rtp(len == 7, 123, len);
            stream.extend_from_slice(&(packet.len() as u16).to_be_bytes());
            stream.extend_from_slice(&packet);
        }
        // Deliver in uneven pieces so frames straddle reads.
        for piece in stream.chunks(333) {
            conn.write_all(piece).unwrap();
            conn.flush().unwrap();
        }
        drop(conn);

        let stats = wait_for_packets(&control, &prepared.session_id, 3);
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.max_payload, 1200);
        assert_eq!(stats.markers, 1);
        assert_eq!(stats.payload_types, BTreeSet::from([123]));
    }
}
