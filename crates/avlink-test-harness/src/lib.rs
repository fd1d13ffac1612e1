//! avlink-test-harness: mock transports and a scripted TCP device.
//!
//! [`MockTransport`] (with its [`MockHandle`] and [`MockConnector`]) drives
//! deterministic unit tests of the link engine, including chunked and
//! delayed replies under tokio's paused clock. [`MockTcpDevice`] exercises
//! the real TCP transport end to end.

pub mod mock_tcp;
pub mod mock_transport;

pub use mock_tcp::MockTcpDevice;
pub use mock_transport::{MockConnector, MockHandle, MockTransport, ReplyChunk, SentFrame};
