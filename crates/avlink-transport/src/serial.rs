//! RS232 ports and USB serial adapters.
//!
//! Most A/V gear runs 9600 8N1 with no handshaking; newer processors and
//! preamps often run 115200. The model file's `rs232` block deserializes
//! straight into [`SerialConfig`].
//!
//! ```no_run
//! use avlink_transport::{SerialConfig, SerialTransport};
//! use avlink_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> avlink_core::Result<()> {
//! let mut port = SerialTransport::open("/dev/ttyUSB0", &SerialConfig::default()).await?;
//! port.send(b"PWR?\r").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = port.receive(&mut buf, Duration::from_secs(1)).await?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use avlink_core::error::{escape_bytes, Error, Result};
use avlink_core::transport::Transport;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

/// Line settings for an RS232 port.
///
/// Defaults to 9600 8N1 with no flow control. Device models carry their
/// own settings, and callers override single fields when a unit has been
/// reconfigured from its front panel.
///
/// Deserializes from the `rs232` block of a model definition:
///
/// ```
/// # use avlink_transport::{SerialConfig, Parity};
/// let config: SerialConfig = serde_yaml::from_str("baudrate: 115200\nparity: N").unwrap();
/// assert_eq!(config.baud_rate, 115200);
/// assert_eq!(config.parity, Parity::None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    #[serde(alias = "baudrate")]
    pub baud_rate: u32,
    #[serde(alias = "bytesize")]
    pub data_bits: DataBits,
    #[serde(alias = "stopbits")]
    pub stop_bits: StopBits,
    pub parity: Parity,
    #[serde(alias = "flowcontrol")]
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// Conventional shorthand, e.g. `9600 8N1` or `115200 7E2 rtscts`.
impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            u8::from(self.data_bits),
            parity,
            u8::from(self.stop_bits)
        )?;
        match self.flow_control {
            FlowControl::None => Ok(()),
            FlowControl::Software => f.write_str(" xonxoff"),
            FlowControl::Hardware => f.write_str(" rtscts"),
        }
    }
}

/// Character size. Model files write it as a number (`bytesize: 8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => return Err(format!("bytesize must be 5-8, got {other}")),
        })
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        use tokio_serial::DataBits as D;
        match bits {
            DataBits::Five => D::Five,
            DataBits::Six => D::Six,
            DataBits::Seven => D::Seven,
            DataBits::Eight => D::Eight,
        }
    }
}

/// Stop bits. Model files write it as a number (`stopbits: 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("stopbits must be 1 or 2, got {other}")),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity. Accepts both `none`/`odd`/`even` and the single letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[serde(alias = "N")]
    None,
    #[serde(alias = "O")]
    Odd,
    #[serde(alias = "E")]
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Handshaking. Most A/V gear uses none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    #[serde(alias = "xonxoff")]
    Software,
    #[serde(alias = "rtscts")]
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// An open RS232 port.
pub struct SerialTransport {
    port: Option<SerialStream>,
    path: String,
    config: SerialConfig,
}

impl SerialTransport {
    /// Open `path` with the given line settings.
    ///
    /// ```no_run
    /// # use avlink_transport::{SerialTransport, SerialConfig, FlowControl};
    /// # async fn example() -> avlink_core::Result<()> {
    /// let config = SerialConfig {
    ///     baud_rate: 115200,
    ///     flow_control: FlowControl::Hardware,
    ///     ..Default::default()
    /// };
    /// let transport = SerialTransport::open("/dev/ttyUSB0", &config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(path: &str, config: &SerialConfig) -> Result<Self> {
        tracing::debug!(path, settings = %config, "opening serial port");

        let mut stream = tokio_serial::new(path, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| Error::Transport(format!("cannot open {path}: {e}")))?;

        // Some adapters feed the device's handshake lines from DTR/RTS.
        // With no hardware flow control both stay low.
        if config.flow_control != FlowControl::Hardware {
            let lines = stream
                .write_data_terminal_ready(false)
                .and_then(|_| stream.write_request_to_send(false));
            if let Err(e) = lines {
                tracing::debug!(path, error = %e, "could not lower DTR/RTS");
            }
        }

        tracing::info!(path, settings = %config, "serial port open");
        Ok(Self {
            port: Some(stream),
            path: path.to_string(),
            config: config.clone(),
        })
    }

    /// Device path this transport was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Line settings in effect.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(path = %self.path, data = %escape_bytes(data), "tx");
        port.write_all(data).await.map_err(port_error)?;
        port.flush().await.map_err(port_error)
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        let n = tokio::time::timeout(timeout, port.read(buf))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(port_error)?;

        tracing::trace!(path = %self.path, data = %escape_bytes(&buf[..n]), "rx");
        Ok(n)
    }

    async fn reset_buffers(&mut self) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        port.clear(ClearBuffer::All)
            .map_err(|e| Error::Transport(format!("cannot clear {} buffers: {e}", self.path)))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut port) = self.port.take() else {
            return Ok(());
        };
        if let Err(e) = port.flush().await {
            tracing::debug!(path = %self.path, error = %e, "flush on close failed");
        }
        tracing::info!(path = %self.path, "serial port closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

/// Unplugging a USB adapter shows up as a broken pipe on most platforms.
fn port_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_9600_8n1() {
        assert_eq!(SerialConfig::default().to_string(), "9600 8N1");
    }

    #[test]
    fn display_shows_flow_control() {
        let config = SerialConfig {
            baud_rate: 115200,
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            stop_bits: StopBits::Two,
            flow_control: FlowControl::Hardware,
        };
        assert_eq!(config.to_string(), "115200 7E2 rtscts");
    }

    #[test]
    fn serial_config_from_model_block() {
        let yaml = "baudrate: 115200\nbytesize: 7\nstopbits: 2\nparity: E\n";
        let config: SerialConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.stop_bits, StopBits::Two);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.flow_control, FlowControl::None);
    }

    #[test]
    fn serial_config_rejects_bad_data_bits() {
        let err = serde_yaml::from_str::<SerialConfig>("bytesize: 9").unwrap_err();
        assert!(err.to_string().contains("bytesize must be 5-8"), "{err}");
        assert!(serde_yaml::from_str::<SerialConfig>("stopbits: 3").is_err());
    }

    #[test]
    fn serial_config_long_field_names() {
        let yaml = "baud_rate: 19200\nflow_control: hardware\n";
        let config: SerialConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.flow_control, FlowControl::Hardware);
    }

    #[test]
    fn settings_map_onto_tokio_serial() {
        assert_eq!(
            tokio_serial::DataBits::from(DataBits::Seven),
            tokio_serial::DataBits::Seven
        );
        assert_eq!(
            tokio_serial::StopBits::from(StopBits::Two),
            tokio_serial::StopBits::Two
        );
        assert_eq!(
            tokio_serial::Parity::from(Parity::Odd),
            tokio_serial::Parity::Odd
        );
        assert_eq!(
            tokio_serial::FlowControl::from(FlowControl::Software),
            tokio_serial::FlowControl::Software
        );
    }

    #[tokio::test]
    async fn open_missing_port_names_the_path() {
        let result =
            SerialTransport::open("/dev/avlink-does-not-exist", &SerialConfig::default()).await;
        match result {
            Err(Error::Transport(msg)) => assert!(msg.contains("/dev/avlink-does-not-exist"), "{msg}"),
            Err(other) => panic!("expected Transport error, got {other:?}"),
            Ok(_) => panic!("opened a port that does not exist"),
        }
    }
}
