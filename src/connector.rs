//! Pluggable transport: how a [`crate::peer::Peer`] opens its socket.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can serve as a peer's duplex byte stream: a `TcpStream` in
/// production, an in-memory duplex pipe in tests, or a Tor `DataStream`.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// Opens connections to peer addresses.
///
/// Abstracted so a Tor transport (or an in-memory test harness) can stand in
/// for a direct `TcpStream::connect` without `Peer` knowing the difference.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> io::Result<Box<dyn AsyncReadWrite>>;
}

/// The production connector: a plain TCP connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<Box<dyn AsyncReadWrite>> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_connector_reports_io_errors_rather_than_panicking() {
        let connector = TcpConnector;
        // Port 0 on a specific loopback address is not listening; connect
        // should fail cleanly rather than hang or panic.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_millis(200), connector.connect(addr)).await;
        match result {
            Ok(inner) => assert!(inner.is_err()),
            Err(_) => {} // timed out attempting the connection; also acceptable
        }
    }
}
