//! Raw TCP transport: the default byte stream for native chat clients.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::{
    Connection, ConnectionId, ConnectionReader, ConnectionWriter, Transport,
    TransportError,
};

/// Size of the buffer used for a single socket read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A TCP [`Transport`] that listens for incoming connections.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self { listener })
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn accept(&mut self) -> Result<Self::Connection, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        // Chat frames are small and latency-sensitive.
        let _ = stream.set_nodelay(true);

        let id = ConnectionId::next();
        tracing::debug!(%id, %addr, "accepted TCP connection");
        Ok(TcpConnection { id, addr, stream })
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }
}

/// A single accepted TCP connection.
pub struct TcpConnection {
    id: ConnectionId,
    addr: SocketAddr,
    stream: TcpStream,
}

impl Connection for TcpConnection {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    fn split(self) -> (TcpReader, TcpWriter) {
        let (read, write) = self.stream.into_split();
        (
            TcpReader {
                half: read,
                buf: vec![0; READ_CHUNK_SIZE],
            },
            TcpWriter { half: write },
        )
    }
}

/// Read half of a [`TcpConnection`].
pub struct TcpReader {
    half: OwnedReadHalf,
    buf: Vec<u8>,
}

impl ConnectionReader for TcpReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let n = self
            .half
            .read(&mut self.buf)
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }
}

/// Write half of a [`TcpConnection`].
pub struct TcpWriter {
    half: OwnedWriteHalf,
}

impl ConnectionWriter for TcpWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.half
            .write_all(data)
            .await
            .map_err(TransportError::SendFailed)?;
        self.half.flush().await.map_err(TransportError::SendFailed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.half
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)
    }
}
