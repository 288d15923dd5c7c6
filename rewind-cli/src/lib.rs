//! Interactive shell for the rewind connection runtime.
//!
//! The shell drives a [`rewind_core::Connection`] over the in-memory backend,
//! which makes it useful for trying out client-side statements, batching and
//! retry behaviour without a database.

pub mod display;
pub mod listener;

pub use display::render;
pub use listener::LoggingListener;
