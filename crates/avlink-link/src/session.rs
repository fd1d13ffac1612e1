//! The link session: one task that owns one device link.
//!
//! A [`LinkSession`] spawns a tokio task that exclusively owns the
//! [`Transport`] for a single device. Every command goes through the task's
//! request queue and is served to completion before the next one is
//! dequeued, so at most one command is ever in flight and writes from
//! concurrent callers never interleave. Queue order is service order.
//!
//! For each command the task:
//!
//! 1. opens the transport if it is not open yet, retrying until the
//!    command's deadline;
//! 2. sleeps out the minimum inter-command interval;
//! 3. discards stale bytes (partial line, OS buffers, anything readable);
//! 4. writes the request in one piece;
//! 5. waits for the first complete line, or the deadline.
//!
//! Between commands the task keeps reading, so unsolicited lines reach
//! subscribers as [`LinkEvent::Line`] events. A transport I/O error ends the
//! link for good: the pending command fails with [`Error::Link`] and later
//! commands are refused. Opening a new session is the way to reconnect.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use avlink_core::error::{escape_bytes, Error, Result};
use avlink_core::events::LinkEvent;
use avlink_core::transport::{Connector, Transport};
use avlink_core::types::{LinkState, ResponseLine, WireEncoding};

use crate::frame::{LineFramer, DEFAULT_EOL, MAX_BUF};
use crate::matcher::ResponseMatcher;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Poll interval for idle reads between commands.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Delay between lazy connection attempts.
const CONNECT_RETRY: Duration = Duration::from_millis(250);

/// Response timeouts are logged at info level at most this often.
const TIMEOUT_LOG_BURST: u32 = 2;
const TIMEOUT_LOG_WINDOW: Duration = Duration::from_secs(300);

/// Configuration for a link session.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Line terminator of the device's replies.
    pub response_eol: Vec<u8>,
    /// Encoding used to decode replies.
    pub encoding: WireEncoding,
    /// Minimum time between the starts of two consecutive writes.
    pub min_command_interval: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Patterns used to annotate every framed line.
    pub matcher: Option<Arc<ResponseMatcher>>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            response_eol: DEFAULT_EOL.to_vec(),
            encoding: WireEncoding::Ascii,
            min_command_interval: Duration::ZERO,
            event_capacity: 256,
            matcher: None,
        }
    }
}

/// One request for the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Encoded bytes, written as a single unit.
    pub bytes: Vec<u8>,
    /// Wait for a reply line after writing.
    pub expect_response: bool,
    /// Leading reply bytes to ignore before looking for the line.
    pub skip_bytes: usize,
    /// Bounds the wait for the link, and separately the wait for the reply.
    ///
    /// The two waits do not share a budget, and the throttle delay comes on
    /// top, so a lazily connected `send` can take up to twice `timeout` plus
    /// the minimum command interval.
    pub timeout: Duration,
    /// Action id, for error context.
    pub action: Option<String>,
}

impl Command {
    /// A command that waits for one reply line.
    pub fn query(bytes: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        Command {
            bytes: bytes.into(),
            expect_response: true,
            skip_bytes: 0,
            timeout,
            action: None,
        }
    }

    /// A command that returns as soon as it is written.
    pub fn write_only(bytes: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        Command {
            expect_response: false,
            ..Command::query(bytes, timeout)
        }
    }

    pub fn skip_bytes(mut self, skip_bytes: usize) -> Self {
        self.skip_bytes = skip_bytes;
        self
    }

    pub fn for_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// A queued command and the channel its result goes back on.
struct PendingCommand {
    command: Command,
    reply: oneshot::Sender<Result<Option<ResponseLine>>>,
}

/// A request sent from session handles to the link task.
enum Request {
    Connect { reply: oneshot::Sender<Result<()>> },
    Send(PendingCommand),
    Close { reply: oneshot::Sender<()> },
}

/// Handle to a link task.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Dropping the
/// last handle stops the task and closes the transport.
pub struct LinkSession {
    tx: mpsc::Sender<Request>,
    state_rx: watch::Receiver<LinkState>,
    event_tx: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LinkSession {
    /// Start a session that opens its transport through `connector` on first
    /// use. Must be called from within a tokio runtime.
    pub fn spawn(connector: Arc<dyn Connector>, config: LinkConfig) -> Self {
        Self::start(Some(connector), None, config)
    }

    /// Start a session over an already-open transport.
    pub fn from_transport(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Self::start(None, Some(transport), config)
    }

    fn start(
        connector: Option<Arc<dyn Connector>>,
        transport: Option<Box<dyn Transport>>,
        config: LinkConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Request>(64);
        let initial = if transport.is_some() {
            LinkState::Idle
        } else {
            LinkState::Disconnected
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let cancel = CancellationToken::new();

        let driver = LinkDriver {
            connector,
            transport,
            failure: None,
            framer: LineFramer::new(&config.response_eol),
            encoding: config.encoding,
            min_interval: config.min_command_interval,
            matcher: config.matcher,
            last_send: None,
            state_tx,
            event_tx: event_tx.clone(),
            timeout_log: TimeoutLog::default(),
        };
        let task = tokio::spawn(io_loop(driver, rx, cancel.clone()));

        LinkSession {
            tx,
            state_rx,
            event_tx,
            cancel,
            task,
        }
    }

    /// Open the transport now instead of on first use.
    ///
    /// A failed attempt leaves the session disconnected; a later command
    /// will try again.
    pub async fn connect(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Connect { reply: reply_tx })
            .await
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    /// Queue a command and wait for its result.
    ///
    /// Returns `Ok(None)` once written when no response is expected, or the
    /// first framed reply line. Dropping the returned future cancels the
    /// command; if it was already written, its reply is discarded.
    pub async fn send(&self, command: Command) -> Result<Option<ResponseLine>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Send(PendingCommand {
                command,
                reply: reply_tx,
            }))
            .await
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    /// Subscribe to framed lines and connection changes.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Whether the link task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Close the transport and stop the task.
    ///
    /// Commands still queued fail with [`Error::Closed`]. Closing twice is
    /// a no-op.
    pub async fn close(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Request::Close { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        Ok(())
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// The main loop. Runs as a spawned tokio task.
///
/// `biased` so that cancellation beats requests and requests beat idle
/// reads. An idle read in progress is dropped when a request arrives; the
/// transports' reads are cancel-safe.
async fn io_loop(
    mut driver: LinkDriver,
    mut rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    loop {
        let idle = driver.transport.is_some();
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("link task cancelled");
                break;
            }

            req = rx.recv() => {
                match req {
                    Some(Request::Send(pending)) => driver.execute(pending).await,
                    Some(Request::Connect { reply }) => {
                        let result = driver.connect_now().await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Close { reply }) => {
                        debug!("link close requested");
                        driver.close().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        debug!("all session handles dropped, exiting link task");
                        break;
                    }
                }
            }

            _ = driver.read_idle(), if idle => {}
        }
    }
    driver.close().await;
}

/// State owned by the link task.
struct LinkDriver {
    connector: Option<Arc<dyn Connector>>,
    transport: Option<Box<dyn Transport>>,
    /// Set once a transport I/O error has ended the link.
    failure: Option<String>,
    framer: LineFramer,
    encoding: WireEncoding,
    min_interval: Duration,
    matcher: Option<Arc<ResponseMatcher>>,
    /// Start of the most recent write.
    last_send: Option<Instant>,
    state_tx: watch::Sender<LinkState>,
    event_tx: broadcast::Sender<LinkEvent>,
    timeout_log: TimeoutLog,
}

/// How an exchange ended, when the caller is still listening.
enum Outcome {
    Done(Result<Option<ResponseLine>>),
    Abandoned,
}

impl LinkDriver {
    fn set_state(&self, state: LinkState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state || *current == LinkState::Closed {
                false
            } else {
                trace!(from = %current, to = %state, "link state change");
                *current = state;
                true
            }
        });
    }

    /// Back to `Idle` or `Disconnected` after a command, whatever happened.
    fn settle(&self) {
        if self.transport.is_some() {
            self.set_state(LinkState::Idle);
        } else {
            self.set_state(LinkState::Disconnected);
        }
    }

    // -----------------------------------------------------------------------
    // Connection management
    // -----------------------------------------------------------------------

    fn refuse_if_failed(&self) -> Result<()> {
        match &self.failure {
            Some(reason) => Err(Error::Link(reason.clone())),
            None => Ok(()),
        }
    }

    fn attach(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.framer.clear();
        self.set_state(LinkState::Idle);
        let _ = self.event_tx.send(LinkEvent::Connected);
    }

    /// Single attempt, reporting the connector's own error.
    async fn connect_now(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        self.refuse_if_failed()?;
        let connector = self.connector.clone().ok_or(Error::NotConnected)?;

        self.set_state(LinkState::Connecting);
        match connector.connect().await {
            Ok(transport) => {
                debug!(target = %connector.describe(), "link opened");
                self.attach(transport);
                Ok(())
            }
            Err(e) => {
                debug!(target = %connector.describe(), error = %e, "connect failed");
                self.set_state(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    /// Open the transport if needed, retrying until `deadline`.
    async fn ensure_connected(&mut self, deadline: Instant) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        self.refuse_if_failed()?;
        let connector = self.connector.clone().ok_or(Error::NotConnected)?;
        let target = connector.describe();

        self.set_state(LinkState::Connecting);
        loop {
            match timeout_at(deadline, connector.connect()).await {
                Ok(Ok(transport)) => {
                    debug!(target = %target, "link opened");
                    self.attach(transport);
                    return Ok(());
                }
                Ok(Err(e)) => debug!(target = %target, error = %e, "connect attempt failed"),
                Err(_) => break,
            }
            let retry_at = Instant::now() + CONNECT_RETRY;
            if retry_at >= deadline {
                sleep_until(deadline).await;
                break;
            }
            sleep_until(retry_at).await;
        }

        debug!(target = %target, "link not ready before deadline");
        self.set_state(LinkState::Disconnected);
        Err(Error::NotConnected)
    }

    /// Tear down after a transport I/O error and return the error to report.
    async fn fail_link(&mut self, error: Error) -> Error {
        let reason = error.to_string();
        warn!(error = %reason, "link failed");
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close().await;
        }
        self.framer.clear();
        self.failure = Some(reason.clone());
        self.set_state(LinkState::Disconnected);
        let _ = self.event_tx.send(LinkEvent::Disconnected {
            reason: reason.clone(),
        });
        Error::Link(reason)
    }

    async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "error closing transport");
            }
        }
        if *self.state_tx.borrow() != LinkState::Closed {
            self.set_state(LinkState::Closed);
            let _ = self.event_tx.send(LinkEvent::Closed);
        }
    }

    // -----------------------------------------------------------------------
    // Command execution
    // -----------------------------------------------------------------------

    fn throttle_delay(&self) -> Option<Duration> {
        let elapsed = self.last_send?.elapsed();
        (elapsed < self.min_interval).then(|| self.min_interval - elapsed)
    }

    async fn execute(&mut self, pending: PendingCommand) {
        let PendingCommand { command, mut reply } = pending;
        if reply.is_closed() {
            debug!("caller gave up before dispatch, skipping command");
            return;
        }

        let outcome = self.run(&command, &mut reply).await;
        self.settle();
        match outcome {
            Outcome::Done(result) => {
                let _ = reply.send(result);
            }
            Outcome::Abandoned => {
                debug!(request = %escape_bytes(&command.bytes), "command cancelled by caller");
            }
        }
    }

    async fn run(
        &mut self,
        command: &Command,
        reply: &mut oneshot::Sender<Result<Option<ResponseLine>>>,
    ) -> Outcome {
        let connect_deadline = Instant::now() + command.timeout;
        let ready = tokio::select! {
            ready = self.ensure_connected(connect_deadline) => ready,
            _ = reply.closed() => return Outcome::Abandoned,
        };
        if let Err(e) = ready {
            return Outcome::Done(Err(e));
        }

        if let Some(delay) = self.throttle_delay() {
            trace!(delay_ms = delay.as_millis() as u64, "throttling before write");
            // Keep reading while waiting so device chatter still reaches listeners.
            let throttle = sleep(delay);
            tokio::pin!(throttle);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut throttle => break,
                    _ = reply.closed() => return Outcome::Abandoned,
                    _ = self.read_idle() => {
                        if self.transport.is_none() {
                            let error = match self.refuse_if_failed() {
                                Err(e) => e,
                                Ok(()) => Error::NotConnected,
                            };
                            return Outcome::Done(Err(error));
                        }
                    }
                }
            }
        }

        // From here until the write completes nothing is cancelled.
        if let Err(e) = self.flush().await {
            return Outcome::Done(Err(self.fail_link(e).await));
        }
        if let Err(e) = self.write(&command.bytes).await {
            return Outcome::Done(Err(self.fail_link(e).await));
        }
        if !command.expect_response {
            return Outcome::Done(Ok(None));
        }

        self.set_state(LinkState::AwaitingResponse);
        self.framer.set_skip(command.skip_bytes);
        let response_deadline = Instant::now() + command.timeout;
        let result = tokio::select! {
            result = self.await_line(response_deadline) => result,
            _ = reply.closed() => {
                self.framer.clear();
                return Outcome::Abandoned;
            }
        };

        match result {
            Ok(line) => Outcome::Done(Ok(Some(line))),
            Err(Error::Timeout) => {
                let partial = self.framer.clear();
                let error = Error::ResponseTimeout {
                    action: command.action.clone(),
                    request: command.bytes.clone(),
                    partial,
                };
                if self.timeout_log.allow(Instant::now()) {
                    info!(error = %error, "response timeout");
                } else {
                    debug!(error = %error, "response timeout");
                }
                Outcome::Done(Err(error))
            }
            Err(e) => Outcome::Done(Err(self.fail_link(e).await)),
        }
    }

    /// Clear out earlier traffic before a write.
    ///
    /// Bytes already waiting on the transport are framed first and any
    /// complete lines are published as unsolicited. Only the trailing partial
    /// line is discarded. The drain stops after `MAX_BUF` bytes so a device
    /// that never stops talking cannot hold the write back forever.
    async fn flush(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        let mut drained = 0;
        loop {
            if drained >= MAX_BUF {
                warn!(bytes = drained, "device still sending, writing without a full drain");
                break;
            }
            let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
            match transport.receive(&mut buf, Duration::ZERO).await {
                Ok(0) | Err(Error::Timeout) => break,
                Ok(n) => {
                    trace!(data = %escape_bytes(&buf[..n]), "drained before write");
                    drained += n;
                    for line in self.framer.push(&buf[..n]) {
                        self.publish(&line, false);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let stale = self.framer.clear();
        if !stale.is_empty() {
            debug!(bytes = stale.len(), data = %escape_bytes(&stale), "discarding partial line");
        }

        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = transport.reset_buffers().await {
            warn!(error = %e, "failed to reset transport buffers");
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.set_state(LinkState::Sending);
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
        trace!(data = %escape_bytes(bytes), "writing command");
        self.last_send = Some(Instant::now());
        transport.send(bytes).await
    }

    /// Read until the first complete line or `deadline`.
    ///
    /// Returns `Err(Error::Timeout)` at the deadline; other errors come from
    /// the transport.
    async fn await_line(&mut self, deadline: Instant) -> Result<ResponseLine> {
        let mut buf = [0u8; 256];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;
            match transport.receive(&mut buf, deadline - now).await {
                Ok(0) => sleep(Duration::from_millis(10)).await,
                Ok(n) => {
                    let mut lines = self.framer.push(&buf[..n]).into_iter();
                    if let Some(first) = lines.next() {
                        let line = self.publish(&first, true);
                        for rest in lines {
                            self.publish(&rest, false);
                        }
                        return Ok(line);
                    }
                }
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Idle frame processing
    // -----------------------------------------------------------------------

    async fn read_idle(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let mut buf = [0u8; 256];
        match transport.receive(&mut buf, IDLE_POLL).await {
            Ok(n) if n > 0 => {
                for line in self.framer.push(&buf[..n]) {
                    self.publish(&line, false);
                }
            }
            Ok(_) => sleep(Duration::from_millis(10)).await,
            Err(Error::Timeout) => {}
            Err(e) => {
                self.fail_link(e).await;
            }
        }
    }

    /// Decode, annotate, and broadcast one framed line.
    fn publish(&self, raw: &Bytes, solicited: bool) -> ResponseLine {
        let text = self.encoding.decode(raw);
        let matched = self.matcher.as_ref().and_then(|m| m.match_line(&text));
        if matched.is_none() && self.matcher.is_some() {
            debug!(line = ?text, solicited, "line matched no known response pattern");
        }
        let line = ResponseLine {
            text,
            solicited,
            matched,
        };
        let _ = self.event_tx.send(LinkEvent::Line(line.clone()));
        line
    }
}

/// Allows a short burst of log lines per window.
#[derive(Debug, Default)]
struct TimeoutLog {
    window_start: Option<Instant>,
    count: u32,
}

impl TimeoutLog {
    fn allow(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) < TIMEOUT_LOG_WINDOW => {
                self.count += 1;
                self.count <= TIMEOUT_LOG_BURST
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
