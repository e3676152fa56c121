//! Proctoring signaling relay and session-integrity core.
//!
//! The relay binary serves the signaling WebSocket and the room directory
//! over HTTP. The client side (peer coordinators, integrity triggers and
//! the session terminator) is exposed as a library so the CLI and tests can
//! drive a whole candidate session headlessly.

pub mod api;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod integrity;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod session;

pub use config::Config;
pub use error::{ProctorError, Result};
