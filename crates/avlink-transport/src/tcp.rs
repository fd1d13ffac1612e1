//! TCP transport for serial gateways.
//!
//! An iTach IP2SL (or ser2net, or a Moxa NPort in raw mode) exposes one
//! RS232 port as a TCP socket, by default on port 4999. Bytes pass through
//! untouched, so [`TcpTransport`] treats the socket exactly like a serial
//! line. The one difference that matters: gateways drop idle or duplicate
//! clients by closing the socket, which surfaces here as
//! [`Error::ConnectionLost`].
//!
//! ```no_run
//! use avlink_core::transport::Transport;
//! use avlink_transport::TcpTransport;
//! use std::time::Duration;
//!
//! # async fn example() -> avlink_core::Result<()> {
//! let mut gateway = TcpTransport::connect("10.0.0.40", 4999, Duration::from_secs(5)).await?;
//! gateway.send(b"PWR?\r").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = gateway.receive(&mut buf, Duration::from_secs(1)).await?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use avlink_core::error::{escape_bytes, Error, Result};
use avlink_core::transport::Transport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

/// How long to wait for a gateway to accept before giving up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A TCP socket to a serial gateway.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Resolve `host` and connect to the first address that accepts.
    ///
    /// The whole attempt, name resolution included, is bounded by `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        tracing::debug!(host, port, timeout_ms = timeout.as_millis() as u64, "connecting to gateway");

        let stream = tokio::time::timeout(timeout, Self::dial(host, port))
            .await
            .map_err(|_| {
                tracing::warn!(host, port, "gateway did not accept in time");
                Error::Timeout
            })??;

        Self::from_stream(stream)
    }

    async fn dial(host: &str, port: u16) -> Result<TcpStream> {
        let candidates: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| Error::Transport(format!("cannot resolve {host}: {e}")))?
            .collect();

        let mut last_error = None;
        for addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "gateway address refused");
                    last_error = Some(connect_error(e, addr));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Transport(format!("{host} resolved to no addresses"))))
    }

    /// Adopt a socket that is already connected (for example, one accepted
    /// by a test listener).
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;

        // Commands are a few bytes each; Nagle would hold them back.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "TCP_NODELAY not applied");
        }

        tracing::info!(%peer, "gateway connected");
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    /// The gateway's socket address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let peer = self.peer;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(%peer, data = %escape_bytes(data), "tx");
        stream.write_all(data).await.map_err(data_error)?;
        stream.flush().await.map_err(data_error)
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let peer = self.peer;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let n = tokio::time::timeout(timeout, stream.read(buf))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(data_error)?;

        if n == 0 {
            tracing::warn!(%peer, "gateway closed the socket");
            return Err(Error::ConnectionLost);
        }
        tracing::trace!(%peer, data = %escape_bytes(&buf[..n]), "rx");
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        // A gateway that already hung up makes shutdown fail; that is fine.
        if let Err(e) = stream.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "shutdown after peer close");
        }
        tracing::info!(peer = %self.peer, "gateway disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

fn connect_error(e: io::Error, addr: SocketAddr) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => Error::Transport(format!("connection refused: {addr}")),
        _ => Error::Io(e),
    }
}

fn data_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const T: Duration = Duration::from_secs(2);

    async fn gateway() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn query_passes_through_unchanged() {
        let (listener, port) = gateway().await;

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"!1VOL?\r");
            // The amplifier's reply trickles out in two pieces.
            socket.write_all(b"!1VO").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(b"L40\r").await.unwrap();
        });

        let mut link = TcpTransport::connect("127.0.0.1", port, T).await.unwrap();
        assert!(link.is_connected());
        assert_eq!(link.peer().port(), port);

        link.send(b"!1VOL?\r").await.unwrap();

        let mut reply = Vec::new();
        let mut buf = [0u8; 64];
        while !reply.ends_with(b"\r") {
            let n = link.receive(&mut buf, T).await.unwrap();
            reply.extend_from_slice(&buf[..n]);
        }
        assert_eq!(reply, b"!1VOL40\r");

        link.close().await.unwrap();
        device.await.unwrap();
    }

    #[tokio::test]
    async fn hostname_is_resolved() {
        let (listener, port) = gateway().await;
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let link = TcpTransport::connect("localhost", port, T).await;
        // localhost may resolve to ::1 first; the v4 listener must still be found.
        assert!(link.is_ok(), "{:?}", link.err());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connection_names_the_address() {
        let (listener, port) = gateway().await;
        drop(listener);

        match TcpTransport::connect("127.0.0.1", port, T).await {
            Err(Error::Transport(msg)) => {
                assert!(msg.contains("connection refused"), "{msg}");
                assert!(msg.contains(&port.to_string()), "{msg}");
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_host() {
        let result = TcpTransport::connect("no-such-gateway.invalid", 4999, T).await;
        assert!(
            matches!(result, Err(Error::Transport(_)) | Err(Error::Timeout)),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn quiet_device_times_out_without_dropping_the_link() {
        let (listener, port) = gateway().await;
        let device = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut link = TcpTransport::connect("127.0.0.1", port, T).await.unwrap();
        let mut buf = [0u8; 16];
        let result = link.receive(&mut buf, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(link.is_connected());

        // Nothing pending: a zero-length wait is a poll.
        let result = link.receive(&mut buf, Duration::ZERO).await;
        assert!(matches!(result, Err(Error::Timeout)));

        device.abort();
    }

    #[tokio::test]
    async fn gateway_hangup_is_connection_lost() {
        let (listener, port) = gateway().await;
        let device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut link = TcpTransport::connect("127.0.0.1", port, T).await.unwrap();
        device.await.unwrap();

        let mut buf = [0u8; 16];
        let result = link.receive(&mut buf, T).await;
        assert!(matches!(result, Err(Error::ConnectionLost)), "{result:?}");
    }

    #[tokio::test]
    async fn closed_link_refuses_io() {
        let (listener, port) = gateway().await;
        let device = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut link = TcpTransport::connect("127.0.0.1", port, T).await.unwrap();
        link.reset_buffers().await.unwrap();
        link.close().await.unwrap();
        assert!(!link.is_connected());

        assert!(matches!(link.send(b"PWR?\r").await, Err(Error::NotConnected)));
        let mut buf = [0u8; 16];
        assert!(matches!(link.receive(&mut buf, T).await, Err(Error::NotConnected)));

        link.close().await.unwrap();
        device.abort();
    }
}
