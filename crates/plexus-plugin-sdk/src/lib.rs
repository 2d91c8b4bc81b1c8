//! Shared protocol for process-isolated plugins: the link broker, the call
//! transports, hook discovery, HTTP forwarding and the plugin-side runtime.

pub mod api;
pub mod broker;
pub mod helpers;
pub mod hooks;
pub mod http;
pub mod manifest;
pub mod model;
pub mod plugin;
pub mod rpc;
pub mod runtime;
pub mod wire;

pub use api::ApiClient;
pub use broker::{Broker, BrokerError, BrokerOptions, Connection, Side, StreamId};
pub use hooks::{HookId, HookTable, ImplementedSet};
pub use manifest::PluginManifest;
pub use plugin::Plugin;
pub use rpc::{RpcError, Transport, TransportKind};

/// Protocol revision spoken by this SDK.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
