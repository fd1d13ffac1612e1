//! CommandClient -- the action-level API over one link session.
//!
//! A client pairs a [`DeviceModel`] with a [`LinkSession`]. Callers name an
//! action and pass arguments; the client validates them against the
//! action's template, encodes the command, sends it through the session,
//! and interprets the reply.
//!
//! Validation happens before anything reaches the link: an unknown action,
//! missing arguments, or text the wire encoding cannot carry fail without a
//! write. Nothing is retried; retry policy belongs to the caller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use avlink_core::error::{escape_bytes, Error, Result};
use avlink_core::events::LinkEvent;
use avlink_core::types::{Args, LinkState, ResponseLine, ResponseMatch};
use avlink_link::matcher::match_pattern;
use avlink_link::session::{Command, LinkSession};

use crate::model::{ActionDefinition, DeviceModel};

/// Result of [`CommandClient::send_action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResponse {
    /// The reply matched a response pattern.
    Fields(ResponseMatch),
    /// The action has no response pattern; the decoded reply line.
    Text(String),
    /// The action expects no reply; the command was written.
    Sent,
}

impl ActionResponse {
    pub fn fields(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            ActionResponse::Fields(m) => Some(&m.fields),
            _ => None,
        }
    }

    /// One captured field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields()?.get(name).map(String::as_str)
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            ActionResponse::Text(text) => Some(text),
            _ => None,
        }
    }
}

type Listener = Arc<dyn Fn(&ResponseLine) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Action client for one device.
///
/// Built by [`CommandClientBuilder`](crate::builder::CommandClientBuilder).
/// All methods take `&self`; share the client behind an `Arc` to issue
/// commands from several tasks. Commands are serviced in the order they
/// are queued.
pub struct CommandClient {
    model: Arc<DeviceModel>,
    session: LinkSession,
    timeout: Duration,
    listeners: Arc<Mutex<Vec<Listener>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl CommandClient {
    pub(crate) fn new(model: Arc<DeviceModel>, session: LinkSession, timeout: Duration) -> Self {
        CommandClient {
            model,
            session,
            timeout,
            listeners: Arc::new(Mutex::new(Vec::new())),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn model(&self) -> &Arc<DeviceModel> {
        &self.model
    }

    /// Response timeout applied to every command.
    pub fn response_timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the link now rather than on the first command.
    pub async fn connect(&self) -> Result<()> {
        self.session.connect().await
    }

    /// Send an action and interpret its reply.
    ///
    /// Returns [`ActionResponse::Fields`] when the action has a response
    /// pattern, [`ActionResponse::Text`] when it waits for a reply without
    /// one, and [`ActionResponse::Sent`] when it expects no reply. A reply
    /// that matches no known pattern fails with [`Error::NoMatch`].
    pub async fn send_action(&self, action_id: &str, args: &Args) -> Result<ActionResponse> {
        let action = self
            .model
            .action(action_id)
            .ok_or_else(|| Error::UnknownAction(action_id.to_string()))?;

        let missing = action.template.missing(args);
        if !missing.is_empty() {
            return Err(Error::MissingArgument {
                action: action.id.clone(),
                missing,
            });
        }

        let protocol = self.model.protocol();
        let mut bytes = action.template.encode(args, protocol.encoding)?;
        bytes.extend(protocol.encoding.encode(&protocol.command_eol)?);

        debug!(action = %action.id, %args, "sending action");
        let command = Command {
            bytes,
            expect_response: action.expects_response(),
            skip_bytes: protocol.skip_bytes,
            timeout: self.timeout,
            action: Some(action.id.clone()),
        };

        match self.session.send(command).await? {
            Some(line) => interpret(action, line),
            None => Ok(ActionResponse::Sent),
        }
    }

    /// Write bytes as-is, without validation and without waiting for a reply.
    ///
    /// For diagnostics. The write still queues behind other commands and
    /// honors the minimum command interval.
    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        debug!(data = %escape_bytes(data), "sending raw bytes");
        self.session
            .send(Command::write_only(data.to_vec(), self.timeout))
            .await
            .map(|_| ())
    }

    /// Call `callback` for every line that is not a command's result.
    ///
    /// A result that matched no known response pattern is delivered too,
    /// since it cannot be told apart from unrelated device output. The
    /// caller still gets it as [`Error::NoMatch`] or
    /// [`ActionResponse::Text`].
    ///
    /// Callbacks run on a single dispatcher task, one line at a time and in
    /// framing order, so a callback is never invoked concurrently with
    /// itself or another callback. Must be called from within a tokio
    /// runtime.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&ResponseLine) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(callback));

        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.is_none() {
            let events = self.session.subscribe();
            *dispatcher = Some(tokio::spawn(dispatch(events, Arc::clone(&self.listeners))));
        }
    }

    /// Raw session events: every line (solicited or not) and connection
    /// changes.
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.session.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.session.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.session.watch_state()
    }

    /// Close the link. Later commands fail with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}

impl Drop for CommandClient {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.dispatcher).take() {
            task.abort();
        }
    }
}

fn interpret(action: &ActionDefinition, line: ResponseLine) -> Result<ActionResponse> {
    let Some(pattern) = &action.response_pattern else {
        return Ok(ActionResponse::Text(line.text));
    };
    if let Some(m) = match_pattern(&action.id, pattern, &line.text) {
        return Ok(ActionResponse::Fields(m));
    }
    if let Some(m) = line.matched {
        debug!(action = %action.id, matched = %m.action_id, "reply matched another action's pattern");
        return Ok(ActionResponse::Fields(m));
    }
    Err(Error::NoMatch {
        action: action.id.clone(),
        line: line.text,
    })
}

/// Unsolicited lines, plus command results no known pattern recognized.
fn for_listeners(line: &ResponseLine) -> bool {
    !line.solicited || line.matched.is_none()
}

async fn dispatch(mut events: broadcast::Receiver<LinkEvent>, listeners: Arc<Mutex<Vec<Listener>>>) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::Line(line)) if for_listeners(&line) => {
                let snapshot: Vec<Listener> = lock(&listeners).clone();
                for listener in &snapshot {
                    listener(&line);
                }
            }
            Ok(LinkEvent::Closed) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "listener dispatch fell behind; lines were dropped");
            }
        }
    }
    debug!("listener dispatch finished");
}
