//! Pluggable protocol encoders.
//!
//! An [`Encoder`] is the seam between the byte pump and one concrete wire
//! protocol. It delimits the inbound byte stream, splits bytes that must
//! be forwarded unconditionally from units worth showing the operator,
//! and converts complete units to and from [`LogicalMessage`]s that the
//! display and persistence layers can edit and replay.
//!
//! Lifecycle of one unit:
//! ```text
//! IDLE → BUFFERING (arrived) → UNIT_AVAILABLE (available)
//!      → DECODED (decode) → [edited] → ENCODED (encode) → FORWARDED
//! ```
//!
//! [`Encoder::pass_through`] runs every pump cycle before
//! [`Encoder::available`] and drains bytes the operator never sees:
//! connection preambles, control frames, window-gated releases.
//!
//! One encoder instance serves one direction of one connection and owns
//! all of that direction's protocol state.

mod http1;
mod http2;
mod websocket;

pub use http1::Http1Encoder;
pub use http2::{Http2Builder, Http2Encoder};
pub use websocket::WebSocketEncoder;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Characters kept by [`Encoder::summarize`].
const SUMMARY_LIMIT: usize = 100;

/// Which peer a direction's encoder speaks toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Talks to the origin server the way a client would.
    ProxyClient,
    /// Talks to the client application the way the server would.
    ProxyServer,
    /// Drives a fresh connection to replay a captured message.
    ResendClient,
}

/// Replay behavior for captured messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendPolicy {
    /// Open a new connection instead of reusing the live one.
    pub new_connection: bool,
    /// Build a fresh encoder instead of sharing live protocol state.
    pub new_encoder: bool,
}

impl ResendPolicy {
    /// Fresh connection and encoder per replay.
    ///
    /// Multiplexed stateful protocols cannot share a compression context
    /// or stream id space with live traffic.
    pub const fn always_fresh() -> Self {
        Self {
            new_connection: true,
            new_encoder: true,
        }
    }

    /// Replay over the live connection with the live encoder.
    pub const fn reuse_live() -> Self {
        Self {
            new_connection: false,
            new_encoder: false,
        }
    }
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self::always_fresh()
    }
}

/// Protocol-specific framing details carried through a decode so an
/// edited message can be refragmented the way the original arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Framing {
    /// Stream-multiplexed binary frames.
    Http2,
    /// Request/response text.
    Http1 {
        /// Request or status line, verbatim.
        start_line: String,
        /// Body arrived with chunked transfer coding; re-encoding
        /// normalizes it to a Content-Length body.
        chunked: bool,
    },
    /// Masked binary frames.
    WebSocket {
        opcode: u8,
        /// Mask key of the original frame, reused on re-encode.
        mask_key: Option<[u8; 4]>,
    },
    /// Unit that could not be decoded; the body holds the wire bytes.
    Raw,
}

/// One reassembled, protocol-decoded unit for the editable display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalMessage {
    /// Stream the unit travelled on; 0 for protocols without streams.
    pub stream_id: u32,
    /// Whether the unit ended its stream.
    pub end_stream: bool,
    /// Decoded header fields in order, pseudo-headers first.
    pub headers: Vec<(String, String)>,
    /// Message body bytes.
    pub body: Bytes,
    /// Refragmentation details for the encode path.
    pub framing: Framing,
}

impl LogicalMessage {
    /// A unit presented undecoded.
    pub fn raw(body: Bytes) -> Self {
        Self {
            stream_id: 0,
            end_stream: false,
            headers: Vec::new(),
            body,
            framing: Framing::Raw,
        }
    }

    /// Whether this unit carries undecoded wire bytes.
    pub fn is_raw(&self) -> bool {
        matches!(self.framing, Framing::Raw)
    }

    /// First value of a header field, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Short display line identifying the unit.
    ///
    /// The start line for text protocols, the request/response
    /// pseudo-headers for multiplexed ones, empty otherwise.
    pub fn headline(&self) -> String {
        match &self.framing {
            Framing::Http1 { start_line, .. } => start_line.clone(),
            Framing::Http2 => {
                let mut parts = Vec::new();
                for name in [":method", ":path", ":status"] {
                    if let Some(value) = self.header(name) {
                        parts.push(value.to_string());
                    }
                }
                parts.join(" ")
            }
            Framing::WebSocket { .. } | Framing::Raw => String::new(),
        }
    }
}

/// Contract every concrete wire protocol implements.
///
/// The pump calls `arrived`, `pass_through`, `available` and `decode` in
/// that order each cycle; `encode` runs on whichever task submits an
/// edited or replayed message. The display and resend layers never reach
/// past this seam into frame or stream internals.
pub trait Encoder: Send {
    /// Protocol tag for logs and the display layer.
    fn name(&self) -> &'static str;

    /// Length of the first complete protocol unit in `buf`, or `None`
    /// while more bytes are needed.
    fn check_delimiter(&self, buf: &[u8]) -> Result<Option<usize>>;

    /// Buffer inbound bytes; nothing is parsed until the readers run.
    fn arrived(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes to forward without operator involvement.
    fn pass_through(&mut self) -> Result<Option<Bytes>> {
        Ok(None)
    }

    /// One complete protocol unit ready for decode, or `None` while
    /// still accumulating.
    fn available(&mut self) -> Result<Option<Bytes>>;

    /// Interpret one complete unit as an editable message.
    ///
    /// Total over units `available` hands out; an uninterpretable
    /// payload falls back to [`LogicalMessage::raw`] rather than
    /// failing the connection.
    fn decode(&mut self, data: &[u8]) -> Result<LogicalMessage>;

    /// Serialize a possibly edited message back to wire bytes,
    /// re-deriving every length field that depends on payload size.
    fn encode(&mut self, message: LogicalMessage) -> Result<Bytes>;

    /// Replay behavior for captured messages.
    fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy::always_fresh()
    }

    /// History headline: the first 100 printable characters.
    fn summarize(&self, message: &LogicalMessage) -> String {
        let mut line = message.headline();
        if !line.is_empty() && !message.body.is_empty() {
            line.push(' ');
        }
        line.push_str(&printable_prefix(&message.body));
        line.chars().take(SUMMARY_LIMIT).collect()
    }
}

/// Map bytes to their printable ASCII form, non-printables to `.`.
fn printable_prefix(data: &[u8]) -> String {
    data.iter()
        .take(SUMMARY_LIMIT)
        .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
        .collect()
}

/// Inbound accumulator for protocols without a frame layer.
///
/// Backs the common `arrived`/`available` shape: append on arrival,
/// split one unit off the front once the delimiter confirms it.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    buf: BytesMut,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append inbound bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Everything buffered, for the delimiter to inspect.
    #[inline]
    pub fn view(&self) -> &[u8] {
        &self.buf
    }

    /// Split the first `len` bytes off as one unit.
    pub fn take(&mut self, len: usize) -> Bytes {
        self.buf.split_to(len).freeze()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
