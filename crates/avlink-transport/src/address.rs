//! Transport addresses and the connector that opens them.
//!
//! A device is reached either through a local serial port or through a TCP
//! socket on a serial gateway. Addresses are written the way pyserial-style
//! tools write them:
//!
//! | address | link |
//! |---|---|
//! | `/dev/ttyUSB0`, `COM3` | serial port with the given [`SerialConfig`] |
//! | `socket://10.0.0.5:4999/` | TCP |
//! | `10.0.0.5:4999` | TCP |
//! | `socket://10.0.0.5`, `gateway.local` | TCP on port 4999 |

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use avlink_core::error::{Error, Result};
use avlink_core::transport::{Connector, Transport};

use crate::serial::{SerialConfig, SerialTransport};
use crate::tcp::{TcpTransport, DEFAULT_CONNECT_TIMEOUT};

/// Default TCP port of IP2SL serial gateways.
pub const DEFAULT_TCP_PORT: u16 = 4999;

const SOCKET_SCHEME: &str = "socket://";

/// Where and how to open a device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Serial {
        path: String,
        config: SerialConfig,
    },
    Tcp {
        host: String,
        port: u16,
        connect_timeout: Duration,
    },
}

impl TransportConfig {
    /// Parse an address, using `serial` for device paths.
    ///
    /// ```
    /// use avlink_transport::{SerialConfig, TransportConfig};
    ///
    /// let tcp = TransportConfig::parse("socket://10.0.0.5/", SerialConfig::default()).unwrap();
    /// assert_eq!(tcp.to_string(), "socket://10.0.0.5:4999/");
    /// ```
    pub fn parse(address: &str, serial: SerialConfig) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::InvalidAddress("empty address".into()));
        }

        if let Some(rest) = address.strip_prefix(SOCKET_SCHEME) {
            let rest = rest.trim_end_matches('/');
            return Self::parse_host_port(rest, address);
        }

        if is_device_path(address) {
            return Ok(TransportConfig::Serial {
                path: address.to_string(),
                config: serial,
            });
        }

        Self::parse_host_port(address, address)
    }

    /// A TCP address with the default connect timeout.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        TransportConfig::Tcp {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// A serial address.
    pub fn serial(path: impl Into<String>, config: SerialConfig) -> Self {
        TransportConfig::Serial {
            path: path.into(),
            config,
        }
    }

    /// Replace the serial settings; TCP addresses are returned unchanged.
    pub fn with_serial_config(self, config: SerialConfig) -> Self {
        match self {
            TransportConfig::Serial { path, .. } => TransportConfig::Serial { path, config },
            tcp => tcp,
        }
    }

    fn parse_host_port(text: &str, original: &str) -> Result<Self> {
        // Bracketed IPv6 literals carry colons inside the brackets.
        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| Error::InvalidAddress(format!("unterminated '[' in {original}")))?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(Error::InvalidAddress(original.to_string())),
            }
        } else {
            match text.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (text, None),
            }
        };

        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in {original}")));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::InvalidAddress(format!("bad port {p:?} in {original}")))?,
            None => DEFAULT_TCP_PORT,
        };

        Ok(Self::tcp(host, port))
    }
}

fn is_device_path(address: &str) -> bool {
    if address.starts_with('/') || address.starts_with("\\\\.\\") {
        return true;
    }
    let upper = address.to_ascii_uppercase();
    upper
        .strip_prefix("COM")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Serial { path, config } => {
                write!(f, "{path}@{}", config.baud_rate)
            }
            TransportConfig::Tcp { host, port, .. } if host.contains(':') => {
                write!(f, "{SOCKET_SCHEME}[{host}]:{port}/")
            }
            TransportConfig::Tcp { host, port, .. } => {
                write!(f, "{SOCKET_SCHEME}{host}:{port}/")
            }
        }
    }
}

#[async_trait]
impl Connector for TransportConfig {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        match self {
            TransportConfig::Serial { path, config } => {
                let transport = SerialTransport::open(path, config).await?;
                Ok(Box::new(transport))
            }
            TransportConfig::Tcp {
                host,
                port,
                connect_timeout,
            } => {
                let transport = TcpTransport::connect(host, *port, *connect_timeout).await?;
                Ok(Box::new(transport))
            }
        }
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}
