//! Transport and connector traits for device links.
//!
//! The [`Transport`] trait abstracts over the byte stream to one device:
//! a local RS232 port, a TCP socket to an IP2SL-style serial gateway, or a
//! mock in tests. The link session in `avlink-link` owns exactly one
//! `Transport` and is the only code that reads from or writes to it.
//!
//! A [`Connector`] knows how to open a fresh transport. Sessions hold a
//! connector instead of an open transport so the link can be opened lazily
//! on first use.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write all of `data` to the device.
    ///
    /// Returns only once every byte has been handed to the OS (serial TX
    /// buffer, TCP socket). A write is never split across two calls.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes into the provided buffer.
    ///
    /// Returns the number of bytes read. Waits up to `timeout` for data to
    /// arrive; returns [`Error::Timeout`](crate::error::Error::Timeout) if
    /// nothing arrives in time. A zero `timeout` polls for bytes that are
    /// already available.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Discard bytes pending in the OS or hardware buffers.
    ///
    /// Best effort. Transports without such buffers keep the default no-op.
    async fn reset_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Opens transports on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport to the device.
    async fn connect(&self) -> Result<Box<dyn Transport>>;

    /// Human-readable description of the target, for logs.
    fn describe(&self) -> String;
}
