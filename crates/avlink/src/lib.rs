//! # avlink -- Command/Response Links to Legacy A/V Equipment
//!
//! `avlink` drives amplifiers, processors, projectors, and matrix switches
//! that speak line-oriented text protocols over RS232, either on a local
//! serial port or through a TCP serial gateway such as an IP2SL (port 4999).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use avlink::{Args, CommandClientBuilder, DeviceModel, ModelDefinition};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let yaml = std::fs::read_to_string("mcintosh_mx160.yaml")?;
//!     let definition: ModelDefinition = serde_yaml::from_str(&yaml)?;
//!     let model = Arc::new(DeviceModel::from_definition(definition)?);
//!
//!     let client = CommandClientBuilder::new(model)
//!         .url("socket://10.0.0.40/")
//!         .connect()
//!         .await?;
//!
//!     let response = client
//!         .send_action("power.on", &Args::new().with("zone", 1))
//!         .await?;
//!     println!("zone 1 power: {:?}", response.field("state"));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                 | Purpose                                          |
//! |-----------------------|--------------------------------------------------|
//! | `avlink-core`         | [`Transport`] / [`Connector`] traits, types, errors |
//! | `avlink-transport`    | Serial and TCP transports, address parsing       |
//! | `avlink-link`         | Templates, line framing, matching, the link task |
//! | `avlink-client`       | Device models, the action client, blocking API   |
//! | **`avlink`**          | This facade crate -- re-exports everything       |
//!
//! Every device link is owned by one task. Commands queue in FIFO order and
//! run one at a time: connect if needed, honor the minimum command interval,
//! flush stale bytes, write, then wait for the first reply line or the
//! deadline. Lines that arrive between commands, or after a command's
//! result, are published to subscribers.
//!
//! ## Errors
//!
//! Every operation returns [`Result`]. Validation failures
//! ([`Error::MissingArgument`], [`Error::UnknownAction`],
//! [`Error::Encoding`]) never touch the link. [`Error::ResponseTimeout`]
//! carries whatever partial reply was buffered. [`Error::Link`] ends the
//! session; open a new client to reconnect. Nothing is retried
//! automatically.

pub use avlink_core::*;

pub use avlink_client::{
    ActionDefinition, ActionDoc, ActionResponse, BlockingClient, CommandClient,
    CommandClientBuilder, DeviceModel, FieldDoc, ModelDefinition, ModelRegistry, ProtocolConfig,
};
pub use avlink_link::{Command, LinkConfig, LinkSession, ResponseMatcher, Template};
pub use avlink_transport::{
    DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits, TcpTransport,
    TransportConfig, DEFAULT_TCP_PORT,
};

/// Transport implementations and address parsing.
pub mod transport {
    pub use avlink_transport::*;
}

/// Framing, matching, and the link session.
pub mod link {
    pub use avlink_link::*;
}

/// Device models and clients.
pub mod client {
    pub use avlink_client::*;
}
