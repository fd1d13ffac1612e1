//! avlink-client: action-level access to A/V devices.
//!
//! A [`DeviceModel`] is loaded once from data and shared; a
//! [`CommandClient`] binds it to one link and turns `send_action("power.on",
//! args)` into validated, encoded, single-flight exchanges. The
//! [`BlockingClient`] offers the same operations to synchronous callers.
//!
//! # Modules
//!
//! - [`model`] -- model definitions, validation, and the registry
//! - [`client`] -- the async client and its listener dispatch
//! - [`builder`] -- fluent construction with address and timing overrides
//! - [`blocking`] -- a thread-blocking wrapper with its own runtime

pub mod blocking;
pub mod builder;
pub mod client;
pub mod model;

pub use blocking::BlockingClient;
pub use builder::CommandClientBuilder;
pub use client::{ActionResponse, CommandClient};
pub use model::{
    ActionDefinition, ActionDoc, DeviceModel, FieldDoc, ModelDefinition, ModelRegistry,
    ProtocolConfig,
};
