//! NDJSON codec for agent stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length to prevent memory exhaustion caused by unterminated or maliciously
//! large messages from a misbehaving agent process.
//!
//! # Usage
//!
//! Use [`LineCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound). Decoding accepts any line
//! ending and strips a trailing `\r`; encoding appends the host platform's
//! terminator (CRLF on Windows, LF elsewhere).

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{Result, RpcError};

/// Maximum line length accepted by the codec: 1 MiB.
///
/// Inbound lines exceeding this limit cause [`LineCodec::decode`] to return
/// [`RpcError::Protocol`] with `"line too long"` rather than allocating
/// unbounded memory for a single message.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line terminator appended to each outbound message.
#[cfg(windows)]
const LINE_TERMINATOR: &[u8] = b"\r\n";
#[cfg(not(windows))]
const LINE_TERMINATOR: &[u8] = b"\n";

/// NDJSON codec for bidirectional agent stdio streams.
///
/// Delegates inbound line-framing to [`LinesCodec`] with a fixed
/// [`MAX_LINE_BYTES`] limit. Each newline-terminated UTF-8 string is one
/// complete message; a trailing partial fragment is retained across reads.
#[derive(Debug)]
pub struct LineCodec(LinesCodec);

impl LineCodec {
    /// Create a new `LineCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = RpcError;

    /// Decode the next newline-terminated line from `src`, stripping any
    /// trailing `\r` so CRLF peers are handled transparently.
    ///
    /// Returns `Ok(None)` when `src` contains no complete line yet.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(self.0.decode(src).map_err(map_codec_error)?.map(strip_cr))
    }

    /// Decode the final line when the stream reaches EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(self
            .0
            .decode_eof(src)
            .map_err(map_codec_error)?
            .map(strip_cr))
    }
}

impl Encoder<String> for LineCodec {
    type Error = RpcError;

    /// Encode `item` followed by the platform line terminator into `dst`.
    ///
    /// The max-length limit is a decoder-side concern and is not enforced
    /// during encoding.
    ///
    /// # Errors
    ///
    /// Infallible in practice; the signature is fixed by the trait.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(item.len() + LINE_TERMINATOR.len());
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(LINE_TERMINATOR);
        Ok(())
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Remove a trailing `\r` left behind by a CRLF-writing peer.
fn strip_cr(mut line: String) -> String {
    if line.ends_with('\r') {
        line.pop();
    }
    line
}

/// Map a [`LinesCodecError`] to an [`RpcError`].
fn map_codec_error(e: LinesCodecError) -> RpcError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            RpcError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => RpcError::Io(io_err.to_string()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
