//! TCP listener abstraction.
//!
//! Thin wrapper over the runtime's socket layer that gives the registry
//! an explicit backlog, address reuse (so a re-added port can rebind
//! promptly), and ephemeral-port resolution.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// A bound, listening TCP endpoint for one gateway port.
pub struct Acceptor {
    inner: TcpListener,
    port: u16,
}

impl Acceptor {
    /// Bind `0.0.0.0:port` with the given backlog. Port 0 picks an
    /// ephemeral port; [`port`](Self::port) reports the resolved value.
    pub async fn bind(port: u16, backlog: u16) -> io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let inner = socket.listen(backlog.max(1) as u32)?;
        let port = inner.local_addr()?.port();
        Ok(Self { inner, port })
    }

    /// The bound local port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }
}
