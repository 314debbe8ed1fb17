use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use super::{BackendKind, OutboundStream, RtpBackend, StreamId};
use crate::error::{LoadgenError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// RTP over a TCP connection with RFC 4571 framing.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |             LENGTH            |  RTP packet ...               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The OS picks the source port of the connection; the stream's local
/// address is only recorded for logging.
pub struct TcpBackend {
    stream: Option<OutboundStream>,
    remote: Option<SocketAddr>,
    conn: Option<TcpStream>,
    buf: Vec<u8>,
}

impl TcpBackend {
    pub fn new() -> Self {
        Self {
            stream: None,
            remote: None,
            conn: None,
            buf: Vec::with_capacity(1500),
        }
    }
}

impl Default for TcpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpBackend for TcpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tcp
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
        tracing::debug!(%remote, "TCP remote registered");
        self.remote = Some(remote);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let Some(stream) = &self.stream else {
            return Err(LoadgenError::TransportNotConfigured("start before stream creation"));
        };
        let remote = self.remote.ok_or(LoadgenError::RemoteNotSet)?;

        let conn = TcpStream::connect_timeout(&remote, CONNECT_TIMEOUT)?;
        conn.set_nodelay(true)?;
        tracing::debug!(
            local = %conn.local_addr()?,
            leased = %stream.local(),
            %remote,
            "TCP RTP session started"
        );
        self.conn = Some(conn);
        Ok(())
    }

    /// A failed write can leave a partial frame on the wire, so the
    /// connection is dropped and every later write fails.
    fn write(&mut self) -> Result<usize> {
        let (Some(stream), Some(conn)) = (self.stream.as_mut(), self.conn.as_mut()) else {
            return Err(LoadgenError::TransportNotConfigured("write without an open connection"));
        };

        stream.serialize_into(&mut self.buf);
        let len = u16::try_from(self.buf.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "RTP packet exceeds 65535 bytes")
        })?;

        let written = conn
            .write_all(&len.to_be_bytes())
            .and_then(|()| conn.write_all(&self.buf));
        if let Err(e) = written {
            tracing::warn!(error = %e, "TCP RTP write failed, dropping connection");
            self.close();
            return Err(e.into());
        }
        Ok(self.buf.len() + 2)
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
            tracing::debug!("TCP RTP session closed");
        }
    }

    fn outbound(&mut self) -> Option<&mut OutboundStream> {
        self.stream.as_mut()
    }
}
