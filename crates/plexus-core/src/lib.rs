//! Host side of the plugin bridge: process handles, the HTTP relay, the host
//! API server and the front listener.

pub mod api;
pub mod config;
pub mod environment;
pub mod handle;
pub mod proxy;
pub mod router;
pub mod server;

pub use environment::PluginEnvironment;
pub use handle::{Activation, HandleError, HandleOptions, PluginHandle};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
