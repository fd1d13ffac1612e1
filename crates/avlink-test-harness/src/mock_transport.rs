//! Mock transport for deterministic testing of the link engine.
//!
//! [`MockTransport`] implements the [`Transport`] trait with scripted
//! request/reply exchanges. Replies can be split into chunks that become
//! readable after a delay, which is how real serial gateways deliver them.
//! A [`MockHandle`] stays with the test after the transport is moved into a
//! session, so the test can inspect what was written (and when), inject
//! unsolicited bytes, or pull the cable.
//!
//! # Example
//!
//! ```
//! use avlink_test_harness::{MockTransport, ReplyChunk};
//! use std::time::Duration;
//!
//! let mut mock = MockTransport::new();
//! mock.expect(b"PWR?\r", b"PWR1\r");
//! mock.expect_chunked(
//!     b"VOL?\r",
//!     vec![ReplyChunk::now(b"VO"), ReplyChunk::after(Duration::from_millis(20), b"L40\r")],
//! );
//! let handle = mock.handle();
//! assert_eq!(handle.remaining_expectations(), 2);
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use avlink_core::error::{escape_bytes, Error, Result};
use avlink_core::transport::{Connector, Transport};

/// Part of a scripted reply.
#[derive(Debug, Clone)]
pub struct ReplyChunk {
    /// Delay after the previous chunk (or after the write, for the first).
    pub delay: Duration,
    pub bytes: Vec<u8>,
}

impl ReplyChunk {
    /// A chunk readable immediately after the previous one.
    pub fn now(bytes: &[u8]) -> Self {
        Self::after(Duration::ZERO, bytes)
    }

    /// A chunk readable `delay` after the previous one.
    pub fn after(delay: Duration, bytes: &[u8]) -> Self {
        ReplyChunk {
            delay,
            bytes: bytes.to_vec(),
        }
    }
}

/// One write observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    /// When the write started.
    pub at: Instant,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Expectation {
    request: Vec<u8>,
    reply: Vec<ReplyChunk>,
}

#[derive(Debug)]
struct Pending {
    ready_at: Instant,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    expectations: VecDeque<Expectation>,
    inbox: VecDeque<Pending>,
    sent_log: Vec<SentFrame>,
    unplugged: bool,
    closed: bool,
    resets: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MockState>,
    readable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock already fails the test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A mock [`Transport`] for testing without hardware.
///
/// Expectations are consumed in order. A write that does not match the
/// next expectation (or arrives when none are left) fails with
/// [`Error::Transport`], which the link session treats as fatal.
#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

/// Observer and remote control for a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    expectations: VecDeque::new(),
                    inbox: VecDeque::new(),
                    sent_log: Vec::new(),
                    unplugged: false,
                    closed: false,
                    resets: 0,
                }),
                readable: Notify::new(),
            }),
        }
    }

    /// Expect `request`; reply with `response` as soon as it is written.
    ///
    /// An empty `response` means the device stays silent.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        let reply = if response.is_empty() {
            Vec::new()
        } else {
            vec![ReplyChunk::now(response)]
        };
        self.expect_chunked(request, reply);
    }

    /// Expect `request`; reply with the given chunks.
    pub fn expect_chunked(&mut self, request: &[u8], reply: Vec<ReplyChunk>) {
        self.shared.lock().expectations.push_back(Expectation {
            request: request.to_vec(),
            reply,
        });
    }

    /// Get a handle that outlives moving the transport into a session.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandle {
    /// Every write seen so far, with its timestamp.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.shared.lock().sent_log.clone()
    }

    /// Every write seen so far, bytes only.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .sent_log
            .iter()
            .map(|f| f.bytes.clone())
            .collect()
    }

    /// Number of expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.shared.lock().expectations.len()
    }

    /// Number of `reset_buffers` calls.
    pub fn reset_count(&self) -> usize {
        self.shared.lock().resets
    }

    /// Make `bytes` readable now, as if the device sent them unprompted.
    pub fn push_unsolicited(&self, bytes: &[u8]) {
        self.push_unsolicited_after(Duration::ZERO, bytes);
    }

    /// Make `bytes` readable after `delay`.
    pub fn push_unsolicited_after(&self, delay: Duration, bytes: &[u8]) {
        self.shared.lock().inbox.push_back(Pending {
            ready_at: Instant::now() + delay,
            bytes: bytes.to_vec(),
        });
        self.shared.readable.notify_waiters();
    }

    /// Simulate the device disappearing: reads and writes fail from now on.
    pub fn unplug(&self) {
        self.shared.lock().unplugged = true;
        self.shared.readable.notify_waiters();
    }

    /// Whether the owner closed the transport.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(Error::NotConnected);
        }
        if state.unplugged {
            return Err(Error::ConnectionLost);
        }

        let now = Instant::now();
        state.sent_log.push(SentFrame {
            at: now,
            bytes: data.to_vec(),
        });

        let expectation = state.expectations.pop_front().ok_or_else(|| {
            Error::Transport(format!(
                "mock: unexpected write {} (no expectations left)",
                escape_bytes(data)
            ))
        })?;
        if data != expectation.request.as_slice() {
            return Err(Error::Transport(format!(
                "mock: expected write {}, got {}",
                escape_bytes(&expectation.request),
                escape_bytes(data)
            )));
        }

        let mut ready_at = now;
        for chunk in expectation.reply {
            ready_at += chunk.delay;
            state.inbox.push_back(Pending {
                ready_at,
                bytes: chunk.bytes,
            });
        }
        drop(state);
        self.shared.readable.notify_waiters();
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before inspecting state so a concurrent push is not missed.
            let readable = self.shared.readable.notified();
            let wake_at = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(Error::NotConnected);
                }
                if state.unplugged {
                    return Err(Error::ConnectionLost);
                }
                let now = Instant::now();
                match state.inbox.front_mut() {
                    Some(front) if front.ready_at <= now => {
                        let n = front.bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&front.bytes[..n]);
                        front.bytes.drain(..n);
                        if front.bytes.is_empty() {
                            state.inbox.pop_front();
                        }
                        return Ok(n);
                    }
                    Some(front) => front.ready_at.min(deadline),
                    None => deadline,
                }
            };
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::select! {
                _ = readable => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn reset_buffers(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.resets += 1;
        // Only bytes that have already "arrived" sit in an OS buffer.
        let now = Instant::now();
        state.inbox.retain(|p| p.ready_at > now);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.closed = true;
        state.inbox.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.shared.lock();
        !state.closed && !state.unplugged
    }
}

/// A [`Connector`] that hands out one prepared [`MockTransport`].
///
/// The first `failures` attempts fail, which models a gateway that is
/// still booting. Once the transport has been handed out, further attempts
/// fail too.
#[derive(Debug)]
pub struct MockConnector {
    transport: Mutex<Option<MockTransport>>,
    failures: AtomicUsize,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(transport: MockTransport) -> Self {
        MockConnector {
            transport: Mutex::new(Some(transport)),
            failures: AtomicUsize::new(0),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A connector whose device never answers.
    pub fn unreachable() -> Self {
        MockConnector {
            transport: Mutex::new(None),
            failures: AtomicUsize::new(0),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the first `n` connection attempts.
    pub fn fail_first(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Shared counter of connection attempts.
    pub fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(Error::Transport("mock: connection refused".into()));
        }
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match transport {
            Some(t) => Ok(Box::new(t)),
            None => Err(Error::Transport("mock: device unreachable".into())),
        }
    }

    fn describe(&self) -> String {
        "mock://device".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_exchange() {
        let mut mock = MockTransport::new();
        mock.expect(b"PWR?\r", b"PWR1\r");
        let handle = mock.handle();

        mock.send(b"PWR?\r").await.unwrap();
        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"PWR1\r");
        assert_eq!(handle.sent_data(), vec![b"PWR?\r".to_vec()]);
        assert_eq!(handle.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn mismatched_write_is_transport_error() {
        let mut mock = MockTransport::new();
        mock.expect(b"PWR?\r", b"PWR1\r");
        let result = mock.send(b"VOL?\r").await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn write_without_expectation_is_transport_error() {
        let mut mock = MockTransport::new();
        assert!(matches!(mock.send(b"X\r").await, Err(Error::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_chunk_waits_for_its_time() {
        let mut mock = MockTransport::new();
        mock.expect_chunked(
            b"VOL?\r",
            vec![
                ReplyChunk::now(b"VO"),
                ReplyChunk::after(Duration::from_millis(200), b"L40\r"),
            ],
        );
        mock.send(b"VOL?\r").await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock.receive(&mut buf, Duration::ZERO).await.unwrap();
        assert_eq!(&buf[..n], b"VO");

        // Not yet readable within 100ms.
        let early = mock.receive(&mut buf, Duration::from_millis(100)).await;
        assert!(matches!(early, Err(Error::Timeout)));

        let start = Instant::now();
        let n = mock
            .receive(&mut buf, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"L40\r");
        assert!(start.elapsed() <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out_at_deadline() {
        let mut mock = MockTransport::new();
        let start = Instant::now();
        let mut buf = [0u8; 8];
        let result = mock.receive(&mut buf, Duration::from_millis(250)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn small_buffer_reads_chunk_in_pieces() {
        let mut mock = MockTransport::new();
        mock.handle().push_unsolicited(b"ABCDE");
        let mut buf = [0u8; 2];
        let mut got = Vec::new();
        while let Ok(n) = mock.receive(&mut buf, Duration::ZERO).await {
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"ABCDE");
    }

    #[tokio::test]
    async fn push_wakes_blocked_reader() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = mock.receive(&mut buf, Duration::from_secs(5)).await.unwrap();
            buf[..n].to_vec()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.push_unsolicited(b"ZONE2 ON\r");
        assert_eq!(reader.await.unwrap(), b"ZONE2 ON\r");
    }

    #[tokio::test]
    async fn reset_discards_arrived_bytes_only() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        handle.push_unsolicited(b"stale\r");
        handle.push_unsolicited_after(Duration::from_secs(60), b"later\r");

        mock.reset_buffers().await.unwrap();
        assert_eq!(handle.reset_count(), 1);

        let mut buf = [0u8; 16];
        assert!(matches!(
            mock.receive(&mut buf, Duration::ZERO).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn unplug_fails_reads_and_writes() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        handle.unplug();
        assert!(!mock.is_connected());
        let mut buf = [0u8; 8];
        assert!(matches!(
            mock.receive(&mut buf, Duration::from_millis(10)).await,
            Err(Error::ConnectionLost)
        ));
        assert!(matches!(mock.send(b"X").await, Err(Error::ConnectionLost)));
    }

    #[tokio::test]
    async fn close_marks_not_connected() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        mock.close().await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(mock.send(b"X").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn connector_fails_then_hands_out_transport() {
        let connector = MockConnector::new(MockTransport::new()).fail_first(2);
        let attempts = connector.attempts();

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert!(connector.connect().await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
