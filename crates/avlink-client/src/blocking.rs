//! Blocking facade over [`CommandClient`].
//!
//! [`BlockingClient`] owns a small tokio runtime (one worker thread named
//! `avlink-io`) that runs the same link session as the async client. Each
//! call parks the calling thread on [`Runtime::block_on`] until the command
//! completes, so command ordering, throttling, and timeouts behave exactly
//! as they do for async callers.
//!
//! Any number of threads may share one `BlockingClient`; their commands are
//! serviced one at a time in the order they are queued.
//!
//! Do not use a `BlockingClient` from inside an async context: blocking
//! calls and dropping the client both panic there.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use avlink_core::error::Result;
use avlink_core::transport::{Connector, Transport};
use avlink_core::types::{Args, LinkState, ResponseLine};

use crate::builder::CommandClientBuilder;
use crate::client::{ActionResponse, CommandClient};
use crate::model::DeviceModel;

pub struct BlockingClient {
    // Dropped before the runtime it runs on.
    client: CommandClient,
    runtime: Runtime,
}

impl BlockingClient {
    fn runtime() -> Result<Runtime> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("avlink-io")
            .enable_all()
            .build()?;
        Ok(runtime)
    }

    fn start(
        builder: CommandClientBuilder,
        make: impl FnOnce(CommandClientBuilder) -> Result<CommandClient>,
    ) -> Result<Self> {
        let runtime = Self::runtime()?;
        let client = {
            let _guard = runtime.enter();
            make(builder)?
        };
        Ok(BlockingClient { client, runtime })
    }

    /// Build a client that opens its link on the first command.
    pub fn build(builder: CommandClientBuilder) -> Result<Self> {
        Self::start(builder, CommandClientBuilder::build)
    }

    /// Build a client and open its link before returning.
    pub fn connect(builder: CommandClientBuilder) -> Result<Self> {
        let client = Self::build(builder)?;
        client.runtime.block_on(client.client.connect())?;
        Ok(client)
    }

    pub fn with_connector(builder: CommandClientBuilder, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::start(builder, |b| Ok(b.build_with_connector(connector)))
    }

    pub fn with_transport(builder: CommandClientBuilder, transport: Box<dyn Transport>) -> Result<Self> {
        Self::start(builder, |b| Ok(b.build_with_transport(transport)))
    }

    pub fn model(&self) -> &Arc<DeviceModel> {
        self.client.model()
    }

    /// See [`CommandClient::send_action`].
    pub fn send_action(&self, action_id: &str, args: &Args) -> Result<ActionResponse> {
        self.runtime
            .block_on(self.client.send_action(action_id, args))
    }

    /// See [`CommandClient::send_raw`].
    pub fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.runtime.block_on(self.client.send_raw(data))
    }

    /// See [`CommandClient::subscribe`]. Callbacks run on the `avlink-io`
    /// thread.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&ResponseLine) + Send + Sync + 'static,
    {
        let _guard = self.runtime.enter();
        self.client.subscribe(callback);
    }

    pub fn state(&self) -> LinkState {
        self.client.state()
    }

    pub fn close(&self) -> Result<()> {
        self.runtime.block_on(self.client.close())
    }
}
