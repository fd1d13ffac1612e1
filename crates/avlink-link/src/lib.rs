//! avlink-link: the transport-independent half of a device link.
//!
//! One tokio task owns the transport and serves commands one at a time,
//! framing the byte stream into lines and publishing every line to
//! subscribers.
//!
//! # Architecture
//!
//! - [`frame`] -- command templates, line splitting, the incremental framer
//! - [`matcher`] -- regex response patterns, first match in load order
//! - [`session`] -- the link task, its request queue, and the public handle

pub mod frame;
pub mod matcher;
pub mod session;

pub use frame::{split_lines, LineFramer, Template, DEFAULT_EOL, MAX_BUF};
pub use matcher::{match_pattern, ResponseMatcher};
pub use session::{Command, LinkConfig, LinkSession};
