//! Raw transport contract and the default TCP binding.
//!
//! The runtime consumes transports only through [`Dialer`] and [`Listener`];
//! the TCP implementation here is the default binding used by clients and
//! servers that are not handed a custom transport.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, RpcError};

/// Boxed read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One established byte-stream connection, split for independent
/// reader/writer ownership. The codec layered on top serializes writers
/// internally; the reader has exactly one consumer.
pub struct IoStream {
    /// Read half.
    pub reader: BoxedReader,
    /// Write half.
    pub writer: BoxedWriter,
    /// Peer address, for diagnostics.
    pub peer_addr: String,
}

impl std::fmt::Debug for IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoStream")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Opens outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dials `addr`, failing after `timeout`.
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<IoStream>;
}

/// Accepts inbound connections.
#[async_trait]
pub trait Listener: Send {
    /// Waits for the next inbound connection.
    async fn accept(&mut self) -> Result<IoStream>;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> String;
}

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

/// Default TCP transport.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Binds to `addr` and returns a listener for incoming connections.
    pub async fn listen(&self, addr: &str) -> Result<TcpServerListener> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(RpcError::Io)?;
        let local_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Ok(TcpServerListener {
            listener,
            local_addr,
            nodelay: self.config.nodelay,
        })
    }
}

#[async_trait]
impl Dialer for TcpTransport {
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<IoStream> {
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::unavailable(format!("dial {addr} timed out")))?
            .map_err(|e| RpcError::unavailable(format!("dial {addr}: {e}")))?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(RpcError::Io)?;
        }
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::debug!(addr = addr, "tcp connected");
        let (read, write) = stream.into_split();
        Ok(IoStream {
            reader: Box::new(read),
            writer: Box::new(write),
            peer_addr,
        })
    }
}

/// TCP listener wrapper implementing the [`Listener`] contract.
pub struct TcpServerListener {
    listener: tokio::net::TcpListener,
    local_addr: String,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpServerListener {
    async fn accept(&mut self) -> Result<IoStream> {
        let (stream, peer) = self.listener.accept().await.map_err(RpcError::Io)?;
        if self.nodelay {
            stream.set_nodelay(true).map_err(RpcError::Io)?;
        }
        let (read, write) = stream.into_split();
        Ok(IoStream {
            reader: Box::new(read),
            writer: Box::new(write),
            peer_addr: peer.to_string(),
        })
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_dial_and_accept() {
        let transport = TcpTransport::default();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let dial_transport = transport.clone();
        let dial = tokio::spawn(async move {
            dial_transport
                .dial(&addr, Duration::from_secs(1))
                .await
                .unwrap()
        });

        let mut server_side = listener.accept().await.unwrap();
        let mut client_side = dial.await.unwrap();

        client_side.writer.write_all(b"ping").await.unwrap();
        client_side.writer.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server_side.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_dial_refused_is_unavailable() {
        let transport = TcpTransport::default();
        // Bind and immediately drop to obtain a dead port.
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let err = transport
            .dial(&addr, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.retryable());
    }
}
