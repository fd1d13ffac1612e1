//! CommandClientBuilder -- fluent builder for [`CommandClient`] instances.
//!
//! Separates configuration from construction so that callers can pick the
//! device address, override the model's serial settings (units are often
//! reconfigured from the front panel), and tune timing before any link is
//! opened.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use avlink_client::builder::CommandClientBuilder;
//! use avlink_client::model::{DeviceModel, ModelDefinition};
//!
//! # async fn example(definition: ModelDefinition) -> avlink_core::Result<()> {
//! let model = Arc::new(DeviceModel::from_definition(definition)?);
//! let client = CommandClientBuilder::new(model)
//!     .url("socket://10.0.0.40:4999/")
//!     .response_timeout(Duration::from_secs(2))
//!     .connect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use avlink_core::error::{Error, Result};
use avlink_core::transport::{Connector, Transport};
use avlink_link::session::{LinkConfig, LinkSession};
use avlink_transport::{SerialConfig, TransportConfig};

use crate::client::CommandClient;
use crate::model::DeviceModel;

/// Fluent builder for [`CommandClient`].
///
/// Timing and serial settings default to the model's protocol block, so the
/// simplest usage is:
///
/// ```ignore
/// let client = CommandClientBuilder::new(model)
///     .url("/dev/ttyUSB0")
///     .build()?;
/// ```
pub struct CommandClientBuilder {
    model: Arc<DeviceModel>,
    url: Option<String>,
    transport: Option<TransportConfig>,
    serial: Option<SerialConfig>,
    baud_rate: Option<u32>,
    response_timeout: Option<Duration>,
    min_command_interval: Option<Duration>,
    event_capacity: Option<usize>,
}

impl CommandClientBuilder {
    /// Create a new builder for the given model.
    pub fn new(model: Arc<DeviceModel>) -> Self {
        CommandClientBuilder {
            model,
            url: None,
            transport: None,
            serial: None,
            baud_rate: None,
            response_timeout: None,
            min_command_interval: None,
            event_capacity: None,
        }
    }

    /// Device address: a serial path (`/dev/ttyUSB0`, `COM3`), `host:port`,
    /// or `socket://host[:port]/`. The TCP port defaults to 4999.
    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Use an already-parsed address instead of [`url`](Self::url).
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport = Some(config);
        self
    }

    /// Replace the model's serial settings.
    pub fn serial_config(mut self, config: SerialConfig) -> Self {
        self.serial = Some(config);
        self
    }

    /// Override only the baud rate.
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = Some(baud);
        self
    }

    /// Set the response timeout (default: the model's `timeout`).
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Set the minimum time between writes (default: the model's
    /// `min_time_between_commands`).
    pub fn min_command_interval(mut self, interval: Duration) -> Self {
        self.min_command_interval = Some(interval);
        self
    }

    /// Capacity of the line broadcast channel (default: 256).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// The address the client will open, with serial overrides applied.
    pub fn resolve_transport(&self) -> Result<TransportConfig> {
        let mut serial = self
            .serial
            .clone()
            .unwrap_or_else(|| self.model.serial_config().clone());
        if let Some(baud) = self.baud_rate {
            serial.baud_rate = baud;
        }
        let overridden = self.serial.is_some() || self.baud_rate.is_some();

        match (&self.transport, &self.url) {
            (Some(config), _) if overridden => Ok(config.clone().with_serial_config(serial)),
            (Some(config), _) => Ok(config.clone()),
            (None, Some(url)) => TransportConfig::parse(url, serial),
            (None, None) => Err(Error::InvalidAddress("no device address configured".into())),
        }
    }

    fn link_config(&self) -> LinkConfig {
        let mut config = self.model.link_config();
        if let Some(interval) = self.min_command_interval {
            config.min_command_interval = interval;
        }
        if let Some(capacity) = self.event_capacity {
            config.event_capacity = capacity;
        }
        config
    }

    fn timeout(&self) -> Duration {
        self.response_timeout
            .unwrap_or(self.model.protocol().timeout)
    }

    /// Build a client that opens its link on the first command.
    ///
    /// Performs no I/O. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<CommandClient> {
        let target = self.resolve_transport()?;
        info!(model = %self.model.id(), %target, "creating device client");
        Ok(self.build_with_connector(Arc::new(target)))
    }

    /// Build a client and open its link before returning.
    pub async fn connect(self) -> Result<CommandClient> {
        let client = self.build()?;
        client.connect().await?;
        Ok(client)
    }

    /// Build a client that opens links through a caller-provided connector.
    pub fn build_with_connector(self, connector: Arc<dyn Connector>) -> CommandClient {
        let config = self.link_config();
        let timeout = self.timeout();
        CommandClient::new(self.model, LinkSession::spawn(connector, config), timeout)
    }

    /// Build a client over an already-open transport.
    ///
    /// This is the entry point for tests (pass a `MockTransport` from
    /// `avlink-test-harness`) and for callers that manage the transport
    /// themselves.
    pub fn build_with_transport(self, transport: Box<dyn Transport>) -> CommandClient {
        let config = self.link_config();
        let timeout = self.timeout();
        CommandClient::new(
            self.model,
            LinkSession::from_transport(transport, config),
            timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::mx160;
    use avlink_core::types::{Args, LinkState};
    use avlink_test_harness::MockTcpDevice;
    use avlink_transport::Parity;
    use pretty_assertions::assert_eq;

    fn builder() -> CommandClientBuilder {
        CommandClientBuilder::new(Arc::new(mx160()))
    }

    #[test]
    fn serial_url_uses_model_settings() {
        let target = builder().url("/dev/ttyUSB0").resolve_transport().unwrap();
        match target {
            TransportConfig::Serial { path, config } => {
                assert_eq!(path, "/dev/ttyUSB0");
                assert_eq!(config.baud_rate, 115_200);
            }
            other => panic!("expected serial, got {other:?}"),
        }
    }

    #[test]
    fn baud_rate_overrides_model() {
        let target = builder()
            .url("COM3")
            .baud_rate(9600)
            .resolve_transport()
            .unwrap();
        assert_eq!(target.to_string(), "COM3@9600");
    }

    #[test]
    fn serial_config_replaces_model_settings() {
        let serial = SerialConfig {
            parity: Parity::Even,
            ..SerialConfig::default()
        };
        let target = builder()
            .url("/dev/ttyS0")
            .serial_config(serial.clone())
            .resolve_transport()
            .unwrap();
        assert_eq!(target, TransportConfig::serial("/dev/ttyS0", serial));
    }

    #[test]
    fn socket_url_defaults_to_gateway_port() {
        let target = builder()
            .url("socket://10.0.0.40/")
            .resolve_transport()
            .unwrap();
        assert_eq!(target, TransportConfig::tcp("10.0.0.40", 4999));
    }

    #[test]
    fn explicit_transport_config_wins() {
        let target = builder()
            .url("/dev/ttyUSB0")
            .transport_config(TransportConfig::tcp("gateway", 5000))
            .resolve_transport()
            .unwrap();
        assert_eq!(target, TransportConfig::tcp("gateway", 5000));
    }

    #[test]
    fn missing_address_is_an_error() {
        assert!(matches!(
            builder().resolve_transport(),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn timing_defaults_follow_model() {
        let b = builder();
        assert_eq!(b.timeout(), Duration::from_secs(2));
        assert_eq!(b.link_config().min_command_interval, Duration::from_millis(500));

        let b = builder()
            .response_timeout(Duration::from_millis(300))
            .min_command_interval(Duration::ZERO)
            .event_capacity(16);
        assert_eq!(b.timeout(), Duration::from_millis(300));
        let config = b.link_config();
        assert_eq!(config.min_command_interval, Duration::ZERO);
        assert_eq!(config.event_capacity, 16);
    }

    #[tokio::test]
    async fn build_is_lazy() {
        let client = builder().url("socket://127.0.0.1:9/").build().unwrap();
        assert_eq!(client.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn end_to_end_over_tcp() {
        let mut device = MockTcpDevice::bind().await.unwrap();
        device.expect(b"PWR3=1\r", b"PWR3=1\r");
        device.expect(b"VUP3\r", b"");
        device.start();

        let client = builder()
            .url(&format!("socket://{}/", device.addr()))
            .min_command_interval(Duration::ZERO)
            .connect()
            .await
            .unwrap();
        assert_eq!(client.state(), LinkState::Idle);

        let zone = Args::new().with("zone", 3);
        let response = client.send_action("power.on", &zone).await.unwrap();
        assert_eq!(response.field("zone"), Some("3"));
        assert_eq!(response.field("state"), Some("1"));
        client.send_action("volume.up", &zone).await.unwrap();

        let received = device.wait().await.unwrap();
        assert_eq!(received, b"PWR3=1\rVUP3\r");
        client.close().await.unwrap();
    }
}
