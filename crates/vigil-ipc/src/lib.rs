//! vigil-ipc — Client side of the detection engine protocol.
//!
//! Length-prefixed JSON over a Unix domain socket: `DETECT`,
//! `EXTRACT_EMBEDDING`, `ENROLL_CAPTURE` and `PING`.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{ClientConfig, DetectionClient, EnrollCapture};
pub use error::IpcError;
pub use protocol::{Command, Request, Response, DEFAULT_SOCKET_PATH};
