//! Audio processing engine.
//!
//! Offline rendering through an active plugin, the per-instance real-time
//! stream thread, and the builtin reference plugins.

pub mod builtin;
pub mod offline;
pub mod stream;

pub use offline::{RenderError, render_offline, validate_inputs};
pub use stream::{StreamError, StreamHandle, StreamProcessor};
