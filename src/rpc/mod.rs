//! JSON-RPC engine core: correlation, timeouts, dispatch, flow control.
//!
//! The module is built around one actor task per connection
//! ([`spawn_connection`]). Submodules hold the state machines the actor
//! owns: the correlation table with its deadline bookkeeping, the
//! flow-control gate, and the inbound method handler registry.

mod connection;
mod gate;
mod handlers;
mod pending;
pub mod retry;

pub use connection::{spawn_connection, RpcHandle};
pub use handlers::{HandlerFuture, HandlerRegistry, MethodHandler};
