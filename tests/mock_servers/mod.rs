#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]
//! Mock backend services for integration tests: an LMS JSON-RPC server and an
//! HQPlayer native-protocol TCP server. No real hardware required.

pub mod hqplayer;
pub mod lms;

pub use hqplayer::MockHqpServer;
pub use lms::MockLmsServer;
