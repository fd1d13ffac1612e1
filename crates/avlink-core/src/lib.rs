//! avlink-core: Core traits, types, and error definitions for avlink.
//!
//! This crate defines the device-agnostic pieces shared by the transports,
//! the link session, and the command client.
//!
//! # Key types
//!
//! - [`Transport`] / [`Connector`] -- byte-level communication channel
//! - [`LinkEvent`] -- lines and connection changes published by a session
//! - [`Args`] / [`ArgValue`] -- named command arguments
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use events::LinkEvent;
pub use transport::{Connector, Transport};
pub use types::*;
