use std::net::{SocketAddr, UdpSocket};

use super::{BackendKind, OutboundStream, RtpBackend, StreamId};
use crate::error::{LoadgenError, Result};

/// RTP over UDP, one packet per datagram.
///
/// The socket is bound to the stream's local address on [`start`](RtpBackend::start),
/// so the peer sees traffic from the port the control plane was told about.
/// It stays unconnected: ICMP errors from a peer that is not listening yet
/// must not fail later sends.
pub struct UdpBackend {
    stream: Option<OutboundStream>,
    remote: Option<SocketAddr>,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpBackend {
    pub fn new() -> Self {
        Self {
            stream: None,
            remote: None,
            socket: None,
            buf: Vec::with_capacity(1500),
        }
    }
}

impl Default for UdpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpBackend for UdpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Udp
    }

    fn create_outbound_stream(&mut self, local: SocketAddr) -> Result<StreamId> {
        if self.stream.is_some() {
            return Err(LoadgenError::StreamAlreadyCreated);
        }
        let id = StreamId(0);
        self.stream = Some(OutboundStream::new(id, local));
        Ok(id)
    }

    fn add_remote(&mut self, remote: SocketAddr) -> Result<()> {
        tracing::debug!(%remote, "UDP remote registered");
        self.remote = Some(remote);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let local = self
            .stream
            .as_ref()
            .map(OutboundStream::local)
            .ok_or(LoadgenError::TransportNotConfigured("start before stream creation"))?;
        let remote = self.remote.ok_or(LoadgenError::RemoteNotSet)?;

        let socket = UdpSocket::bind(local)?;
        tracing::debug!(local = %socket.local_addr()?, %remote, "UDP RTP session started");
        self.socket = Some(socket);
        Ok(())
    }

    fn write(&mut self) -> Result<usize> {
        let (Some(stream), Some(socket), Some(remote)) =
            (self.stream.as_mut(), self.socket.as_ref(), self.remote)
        else {
            return Err(LoadgenError::TransportNotConfigured("write before start"));
        };
        stream.serialize_into(&mut self.buf);
        Ok(socket.send_to(&self.buf, remote)?)
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            tracing::debug!("UDP RTP session closed");
        }
    }

    fn outbound(&mut self) -> Option<&mut OutboundStream> {
        self.stream.as_mut()
    }
}
