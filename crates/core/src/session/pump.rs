use crossbeam_channel::{Receiver, select};

use crate::error::{LoadgenError, Result};
use crate::media::{FramedUnit, Packetizer};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::transport::RtpBackend;

/// Counters kept by a [`PacketPump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PumpStats {
    pub units: u64,
    pub packets: u64,
    pub bytes: u64,
    pub write_failures: u64,
}

/// Consumer side of a session queue: packetizes each unit and writes the
/// fragments through the backend.
///
/// Single write errors are logged and counted. After `max_failures`
/// consecutive errors the pump gives up, fires `fault` so the session
/// starts draining, and reports [`LoadgenError::WriteFailed`].
pub(crate) struct PacketPump {
    label: String,
    backend: Box<dyn RtpBackend>,
    packetizer: Box<dyn Packetizer>,
    max_failures: u32,
    consecutive: u32,
    stats: PumpStats,
}

impl PacketPump {
    pub(crate) fn new(
        label: String,
        backend: Box<dyn RtpBackend>,
        packetizer: Box<dyn Packetizer>,
        max_failures: u32,
    ) -> Self {
        Self {
            label,
            backend,
            packetizer,
            max_failures: max_failures.max(1),
            consecutive: 0,
            stats: PumpStats::default(),
        }
    }

    /// Drain `queue` until it disconnects or `stop` fires. The backend is
    /// closed before returning.
    pub(crate) fn run(
        mut self,
        queue: Receiver<FramedUnit>,
        stop: ShutdownSignal,
        fault: &Shutdown,
    ) -> (PumpStats, Result<()>) {
        tracing::debug!(
            session = %self.label,
            backend = %self.backend.kind(),
            codec = self.packetizer.codec().name(),
            pt = self.packetizer.payload_type(),
            "packet pump started"
        );

        let result = loop {
            select! {
                recv(queue) -> unit => match unit {
                    Ok(unit) => {
                        if let Err(e) = self.emit(unit) {
                            fault.trigger();
                            break Err(e);
                        }
                    }
                    Err(_) => break Ok(()),
                },
                recv(stop.receiver()) -> _ => break Ok(()),
            }
        };

        self.backend.close();
        tracing::debug!(
            session = %self.label,
            units = self.stats.units,
            packets = self.stats.packets,
            bytes = self.stats.bytes,
            write_failures = self.stats.write_failures,
            "packet pump stopped"
        );
        (self.stats, result)
    }

    fn emit(&mut self, unit: FramedUnit) -> Result<()> {
        self.stats.units += 1;
        for fragment in self.packetizer.packetize(unit) {
            match self.backend.send_fragment(&fragment) {
                Ok(written) => {
                    self.consecutive = 0;
                    self.stats.packets += 1;
                    self.stats.bytes += written as u64;
                    tracing::trace!(
                        session = %self.label,
                        bytes = written,
                        ts = fragment.timestamp,
                        marker = fragment.marker,
                        "RTP packet sent"
                    );
                }
                Err(e) => {
                    self.consecutive += 1;
                    self.stats.write_failures += 1;
                    tracing::warn!(
                        session = %self.label,
                        error = %e,
                        consecutive = self.consecutive,
                        "RTP write failed"
                    );
                    if self.consecutive >= self.max_failures {
                        return Err(LoadgenError::WriteFailed {
                            failures: self.consecutive,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::audio::AudioPacketizer;
    use crate::media::h264::{H264Packetizer, PacketizationMode};
    use crate::media::{AudioFrame, NalUnit};
    use crate::transport::{BackendKind, OutboundStream, StreamId};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend that keeps serialized packets in memory.
    struct MemoryBackend {
        stream: OutboundStream,
        sent: Vec<Vec<u8>>,
        failing: bool,
        closed: Arc<AtomicBool>,
    }

    impl MemoryBackend {
        fn new(failing: bool) -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let backend = Self {
                stream: OutboundStream::new(StreamId(0), local),
                sent: Vec::new(),
                failing,
                closed: closed.clone(),
            };
            (backend, closed)
        }
    }

    impl RtpBackend for MemoryBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Udp
        }
        fn create_outbound_stream(&mut self, _local: SocketAddr) -> Result<StreamId> {
            Ok(self.stream.id())
        }
        fn add_remote(&mut self, _remote: SocketAddr) -> Result<()> {
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn write(&mut self) -> Result<usize> {
            if self.failing {
                return Err(std::io::Error::other("unreachable").into());
            }
            let mut buf = Vec::new();
            self.stream.serialize_into(&mut buf);
            let len = buf.len();
            self.sent.push(buf);
            Ok(len)
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn outbound(&mut self) -> Option<&mut OutboundStream> {
            Some(&mut self.stream)
        }
    }

    fn audio_unit(len: usize) -> FramedUnit {
        FramedUnit::Audio(AudioFrame { payload: vec![0xD5; len] })
    }

    #[test]
    fn drains_queue_then_closes_backend() {
        let (backend, closed) = MemoryBackend::new(false);
        let pump = PacketPump::new("test".into(), Box::new(backend), Box::new(AudioPacketizer::new(8, 160)), 4);
        let (tx, rx) = crossbeam_channel::bounded(8);
        for len in [160, 160, 20] {
            tx.send(audio_unit(len)).unwrap();
        }
        drop(tx);

        let fault = Shutdown::new();
        let (stats, result) = pump.run(rx, ShutdownSignal::never(), &fault);
        assert!(result.is_ok());
        assert_eq!(stats.units, 3);
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.bytes, (172 + 172 + 32) as u64);
        assert!(closed.load(Ordering::SeqCst));
        assert!(!fault.is_triggered());
    }

    #[test]
    fn fragments_become_separate_writes() {
        let (backend, _) = MemoryBackend::new(false);
        let packetizer = H264Packetizer::new(123, 1200, PacketizationMode::NonInterleaved);
        let pump = PacketPump::new("video".into(), Box::new(backend), Box::new(packetizer), 4);
        let (tx, rx) = crossbeam_channel::bounded(8);
        tx.send(FramedUnit::Nal(NalUnit {
            payload: vec![0x65; 3000],
            timestamp: 3600,
        }))
        .unwrap();
        drop(tx);

        let (stats, result) = pump.run(rx, ShutdownSignal::never(), &Shutdown::new());
        assert!(result.is_ok());
        assert_eq!(stats.units, 1);
        assert_eq!(stats.packets, 3);
    }

    #[test]
    fn persistent_write_failure_faults_session() {
        let (backend, closed) = MemoryBackend::new(true);
        let pump = PacketPump::new("broken".into(), Box::new(backend), Box::new(AudioPacketizer::new(8, 160)), 3);
        let (tx, rx) = crossbeam_channel::bounded(8);
        for _ in 0..5 {
            tx.send(audio_unit(160)).unwrap();
        }

        let fault = Shutdown::new();
        let (stats, result) = pump.run(rx, ShutdownSignal::never(), &fault);
        assert!(matches!(result, Err(LoadgenError::WriteFailed { failures: 3 })));
        assert_eq!(stats.write_failures, 3);
        assert_eq!(stats.packets, 0);
        assert!(fault.is_triggered());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_signal_ends_pump_with_queue_open() {
        let (backend, closed) = MemoryBackend::new(false);
        let pump = PacketPump::new("idle".into(), Box::new(backend), Box::new(AudioPacketizer::new(8, 160)), 3);
        let (_tx, rx) = crossbeam_channel::bounded::<FramedUnit>(8);
        let stop = Shutdown::new();
        stop.trigger();

        let (stats, result) = pump.run(rx, stop.signal(), &Shutdown::new());
        assert!(result.is_ok());
        assert_eq!(stats, PumpStats::default());
        assert!(closed.load(Ordering::SeqCst));
    }
}
