//! Transport implementations for avlink.
//!
//! This crate provides concrete implementations of the
//! [`Transport`](avlink_core::Transport) trait from `avlink-core`:
//!
//! - [`SerialTransport`]: RS232 ports and USB serial adapters
//! - [`TcpTransport`]: TCP sockets to serial gateways (IP2SL, ser2net)
//!
//! [`TransportConfig`] parses device addresses and implements
//! [`Connector`](avlink_core::Connector), so a link session can open the
//! right transport lazily.

pub mod address;
pub mod serial;
pub mod tcp;

pub use address::{TransportConfig, DEFAULT_TCP_PORT};
pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
pub use tcp::TcpTransport;
