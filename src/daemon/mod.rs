//! Plugin supervisor daemon.
//!
//! Launches every managed plugin described in the registry, restarts the ones
//! that die (with exponential backoff), and exposes a small control protocol
//! over a local socket.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                 PluginManager                  │
//! │  registry  │  identity file  │  control socket │
//! ├────────────────────────────────────────────────┤
//! │     ProcessMonitor (event loop + waiter)       │
//! ├────────────────────────────────────────────────┤
//! │  ProcessProxy │ ProcessProxy │ ProcessProxy ...│
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Every event source (signals, child exits, control requests) wakes the loop
//! through a [`waiter::PipeWriter`]; all fleet mutations happen on the loop.

pub mod client;
pub mod clock;
pub mod identity;
pub mod log_buffer;
pub mod monitor;
pub mod plugin_manager;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod waiter;

#[cfg(test)]
pub(crate) mod testing;

pub use client::ControlClient;
pub use monitor::{Fleet, ProcessMonitor, StopHandle};
pub use plugin_manager::PluginManager;
pub use protocol::{ControlCommand, ControlReply};
pub use proxy::{ProcessConfig, ProcessProxy, ProxyContext, ProxyLifecycle, ProxyTimings};
pub use registry::{PluginDescriptor, PluginRegistry};
pub use server::ControlServer;
