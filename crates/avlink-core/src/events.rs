//! Link event types.
//!
//! Events are published by a link session through a
//! [`tokio::sync::broadcast`] channel. Delivery is best effort: the channel
//! is bounded, so a listener that falls far enough behind misses events
//! and is told how many it skipped.

use crate::types::ResponseLine;

/// An event published by a link session.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The transport was opened.
    Connected,

    /// The transport failed and the session can no longer send.
    Disconnected {
        /// Description of the failure.
        reason: String,
    },

    /// A complete line was framed from the device's byte stream.
    ///
    /// Every line is published, including the one that completed a command
    /// (`solicited == true`).
    Line(ResponseLine),

    /// The session was closed by its owner.
    Closed,
}
