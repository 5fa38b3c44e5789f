//! Agent Conduit: host command-line AI agents as supervised child processes
//! speaking newline-delimited JSON-RPC over stdio.
//!
//! The crate is organized around one actor task per agent connection:
//! [`wire`] frames and classifies the byte stream, [`rpc`] owns
//! correlation, timeouts, dispatch, and flow control, [`supervise`] spawns
//! and monitors the child process, and [`registry`] caps and tracks the set
//! of live sessions.

#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod events;
pub mod registry;
pub mod rpc;
pub mod supervise;
pub mod wire;

pub use config::{EngineConfig, SpawnConfig};
pub use errors::{Result, RpcError};
pub use events::ConnectionEvent;
pub use registry::ConnectionRegistry;
pub use rpc::{HandlerRegistry, RpcHandle};
