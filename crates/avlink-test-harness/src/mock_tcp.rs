//! Scripted TCP device for end-to-end tests.
//!
//! [`MockTcpDevice`] listens on localhost and plays the part of an A/V
//! unit behind a serial gateway: it answers each expected command with a
//! scripted reply (optionally split and delayed) and can push unsolicited
//! status lines between exchanges.
//!
//! # Example
//!
//! ```
//! use avlink_test_harness::MockTcpDevice;
//!
//! # async fn example() -> avlink_core::Result<()> {
//! let mut device = MockTcpDevice::bind().await?;
//! device.expect(b"PWR?\r", b"PWR1\r");
//! device.start();
//!
//! let addr = device.addr();
//! // ... connect a session to `addr` and test ...
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use avlink_core::error::{escape_bytes, Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::mock_transport::ReplyChunk;

#[derive(Debug, Clone)]
enum Step {
    Exchange {
        request: Vec<u8>,
        reply: Vec<ReplyChunk>,
    },
    Push(Vec<u8>),
}

/// A scripted TCP device.
///
/// Accepts a single connection and runs the script in order. A request that
/// does not match the script ends the run with an error reported by
/// [`wait`](MockTcpDevice::wait).
pub struct MockTcpDevice {
    listener: Option<TcpListener>,
    addr: String,
    script: Vec<Step>,
    task: Option<JoinHandle<std::result::Result<Vec<u8>, String>>>,
}

impl MockTcpDevice {
    /// Bind to a random port on 127.0.0.1.
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock device: {}", e)))?;
        let addr = listener.local_addr()?.to_string();
        Ok(Self {
            listener: Some(listener),
            addr,
            script: Vec::new(),
            task: None,
        })
    }

    /// Expect `request`, then reply with `response` in one write.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expect_chunked(request, vec![ReplyChunk::now(response)]);
    }

    /// Expect `request`, then reply with the chunks, flushing each one.
    pub fn expect_chunked(&mut self, request: &[u8], reply: Vec<ReplyChunk>) {
        self.script.push(Step::Exchange {
            request: request.to_vec(),
            reply,
        });
    }

    /// Send `bytes` unprompted at this point in the script.
    pub fn push(&mut self, bytes: &[u8]) {
        self.script.push(Step::Push(bytes.to_vec()));
    }

    /// `host:port` to connect to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Start serving the script in a background task.
    ///
    /// The listener is already bound, so clients may connect as soon as
    /// this returns.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let script = std::mem::take(&mut self.script);
        self.task = Some(tokio::spawn(run_script(listener, script)));
    }

    /// Wait for the script to finish; returns every byte the client sent.
    pub async fn wait(&mut self) -> std::result::Result<Vec<u8>, String> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| format!("mock device task failed: {}", e))?,
            None => Err("mock device was never started".into()),
        }
    }
}

async fn run_script(
    listener: TcpListener,
    script: Vec<Step>,
) -> std::result::Result<Vec<u8>, String> {
    let (mut stream, peer) = listener
        .accept()
        .await
        .map_err(|e| format!("failed to accept connection: {}", e))?;
    tracing::debug!(%peer, "mock device accepted connection");

    let mut received = Vec::new();

    for (i, step) in script.into_iter().enumerate() {
        match step {
            Step::Push(bytes) => {
                stream
                    .write_all(&bytes)
                    .await
                    .map_err(|e| format!("step {}: write error: {}", i, e))?;
            }
            Step::Exchange { request, reply } => {
                let mut buf = vec![0u8; request.len()];
                stream.read_exact(&mut buf).await.map_err(|e| {
                    format!(
                        "step {}: waiting for {}: {}",
                        i,
                        escape_bytes(&request),
                        e
                    )
                })?;
                received.extend_from_slice(&buf);
                if buf != request {
                    return Err(format!(
                        "step {}: expected {}, got {}",
                        i,
                        escape_bytes(&request),
                        escape_bytes(&buf)
                    ));
                }
                for chunk in reply {
                    if chunk.delay > Duration::ZERO {
                        tokio::time::sleep(chunk.delay).await;
                    }
                    stream
                        .write_all(&chunk.bytes)
                        .await
                        .map_err(|e| format!("step {}: write error: {}", i, e))?;
                    stream
                        .flush()
                        .await
                        .map_err(|e| format!("step {}: flush error: {}", i, e))?;
                }
            }
        }
    }

    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_script_in_order() {
        let mut device = MockTcpDevice::bind().await.unwrap();
        device.push(b"HELLO\r");
        device.expect_chunked(
            b"PWR?\r",
            vec![
                ReplyChunk::now(b"PW"),
                ReplyChunk::after(Duration::from_millis(20), b"R1\r"),
            ],
        );
        device.start();

        let mut client = TcpStream::connect(device.addr()).await.unwrap();
        let mut hello = [0u8; 6];
        client.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello, b"HELLO\r");

        client.write_all(b"PWR?\r").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PWR1\r");

        assert_eq!(device.wait().await.unwrap(), b"PWR?\r");
    }

    #[tokio::test]
    async fn mismatch_is_reported() {
        let mut device = MockTcpDevice::bind().await.unwrap();
        device.expect(b"PWR?\r", b"PWR1\r");
        device.start();

        let mut client = TcpStream::connect(device.addr()).await.unwrap();
        client.write_all(b"VOL?\r").await.unwrap();

        let err = device.wait().await.unwrap_err();
        assert!(err.contains("expected"), "{err}");
    }

    #[tokio::test]
    async fn wait_without_start_fails() {
        let mut device = MockTcpDevice::bind().await.unwrap();
        assert!(device.wait().await.is_err());
    }
}
