//! TCP listener and per-connection read loop: accept, then loop reading
//! into a buffer and handing complete units upstream.
use std::io;
use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};

use super::frame::{Framer, OpcMessage};

const READ_CHUNK: usize = 16 * 1024;

pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: &(String, u16)) -> io::Result<Self> {
        let inner = TcpListener::bind((addr.0.as_str(), addr.1)).await?;
        info!("OPC listener bound on {}:{}", addr.0, addr.1);
        Ok(Listener { inner })
    }

    /// Accept one connection. Non-blocking from the caller's point of view:
    /// this is just an `.await` on the one event loop, not an OS-level
    /// blocking call.
    pub async fn accept(&self) -> io::Result<Connection> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true).ok();
        debug!("accepted OPC connection from {peer}");
        Ok(Connection::new(stream, peer))
    }
}

/// One accepted TCP connection with its own reassembly state.
pub struct Connection {
    stream: TcpStream,
    framer: Framer,
    peer: SocketAddr,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Connection {
            stream,
            framer: Framer::new(),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read one chunk from the socket and return every complete message it
    /// produced, in arrival order. Returns `Ok(None)` on clean EOF and an
    /// error (which the caller must treat as "drop this connection") on a
    /// read failure or a framing violation (oversized message).
    pub async fn read_messages(&mut self) -> io::Result<Option<Vec<OpcMessage>>> {
        use tokio::io::AsyncReadExt;

        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Err(e) = self.framer.push(&chunk[..n]) {
            warn!("closing connection {}: {e}", self.peer);
            return Err(e);
        }
        Ok(Some(self.framer.drain_messages()))
    }
}
