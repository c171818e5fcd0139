//! Stdio front end of the plugin host.
//!
//! Reads line-delimited JSON requests, runs them on a worker pool with
//! per-handle ordering, and writes responses and events back as lines.

pub mod commands;
pub mod config;
mod events;
mod pool;
pub mod protocol;
mod sequencer;
mod server;
pub mod transport;

pub use commands::HostContext;
pub use config::{ConfigError, HostConfig};
pub use protocol::{ErrorCode, Outgoing, ProtocolError};
pub use server::Server;
