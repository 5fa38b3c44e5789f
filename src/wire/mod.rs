//! Wire-level concerns of the NDJSON JSON-RPC channel.
//!
//! Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based stream
//!   framing with platform-aware line terminators on write.
//! - `envelope`: the tagged union of JSON-RPC message shapes (request,
//!   response, notification) used at the deserialization boundary.

pub mod codec;
pub mod envelope;

pub use codec::{LineCodec, MAX_LINE_BYTES};
pub use envelope::{
    classify, Envelope, ErrorObject, NotificationEnvelope, RequestEnvelope, ResponseEnvelope,
    JSONRPC_VERSION,
};
