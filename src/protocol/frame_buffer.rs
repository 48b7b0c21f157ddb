//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management and implements a state
//! machine for handling fragmented frames:
//! - `WaitingForHeader`: need the 9 header bytes (or the 24-byte preface)
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//!
//! Because this buffer sits on an intercepted connection rather than an
//! endpoint, nothing it sees may abort the session. Input that fails to
//! parse as a frame body (for example an inconsistent padding length) is
//! still a well-delimited unit, so it is surfaced as
//! [`WireUnit::Malformed`] with its raw bytes intact and left to the
//! forwarding path. `push` is therefore infallible.
//!
//! # Example
//!
//! ```ignore
//! use tapwire::protocol::{FrameBuffer, WireUnit};
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in arbitrary chunks from the tapped socket.
//! for unit in buffer.push(&chunk) {
//!     match unit {
//!         WireUnit::Preface => println!("connection preface"),
//!         WireUnit::Frame(frame) => println!("{:?} frame", frame.kind()),
//!         WireUnit::Malformed(raw) => println!("{} raw bytes", raw.len()),
//!     }
//! }
//! ```

use bytes::{Bytes, BytesMut};
use tracing::warn;

use super::wire_format::{FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, PREFACE};
use super::Frame;

/// One delimited unit recovered from the byte stream.
///
/// The connection preface is not a frame but occupies the same position in
/// the stream, so the buffer reports it as its own variant rather than
/// skipping it silently.
#[derive(Debug, Clone)]
pub enum WireUnit {
    /// The 24-byte connection preface.
    Preface,
    /// A complete, parsed frame.
    Frame(Frame),
    /// A well-delimited unit whose body failed to parse. Carries the raw
    /// header and payload bytes so the forwarding path can relay it
    /// unmodified.
    Malformed(Bytes),
}

impl WireUnit {
    /// Return the contained frame, if this unit is one.
    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            WireUnit::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header (9 bytes) or the preface (24 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: FrameHeader, remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete units.
///
/// Equivalent to calling [`check_delimiter`] in a loop and slicing off each
/// reported unit, but holds partial data across reads so the caller can feed
/// it whatever the socket produced.
///
/// [`check_delimiter`]: super::wire_format::check_delimiter
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Payload size above which a warning is logged. Delimitation is
    /// structural, so oversized frames are still extracted and surfaced.
    warn_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, warn threshold: 16KB payload.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            warn_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Create a new frame buffer with a custom warn threshold, e.g. after a
    /// peer raised its advertised maximum frame size.
    pub fn with_warn_payload(warn_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            warn_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete units.
    ///
    /// This is the main API for processing incoming data from the socket.
    /// Returns the units that became complete; fragmented data is buffered
    /// internally for the next push. Never fails: frames with unparseable
    /// bodies come out as [`WireUnit::Malformed`].
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes from a socket read
    pub fn push(&mut self, data: &[u8]) -> Vec<WireUnit> {
        self.buffer.extend_from_slice(data);

        let mut units = Vec::new();
        while let Some(unit) = self.try_extract_one() {
            units.push(unit);
        }
        units
    }

    /// Try to extract a single unit from the buffer.
    ///
    /// Returns `None` if more data is needed.
    fn try_extract_one(&mut self) -> Option<WireUnit> {
        match &self.state {
            State::WaitingForHeader => {
                // A buffer that matches a prefix of the connection preface
                // cannot be disambiguated from it yet. Hold until the bytes
                // either complete the preface or diverge from it.
                let n = self.buffer.len().min(PREFACE.len());
                if self.buffer[..n] == PREFACE[..n] {
                    if n < PREFACE.len() {
                        return None;
                    }
                    let _ = self.buffer.split_to(PREFACE.len());
                    return Some(WireUnit::Preface);
                }

                if self.buffer.len() < HEADER_SIZE {
                    return None;
                }

                // Peek the header without consuming it yet.
                let header = FrameHeader::decode(&self.buffer[..HEADER_SIZE])
                    .expect("buffer has enough bytes");

                if header.length > self.warn_payload_size {
                    warn!(
                        kind = ?header.kind,
                        stream_id = header.stream_id,
                        length = header.length,
                        threshold = self.warn_payload_size,
                        "frame payload exceeds advertised maximum, relaying anyway"
                    );
                }

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.length == 0 {
                    return Some(Self::finish(header, Bytes::new()));
                }

                self.state = State::WaitingForPayload {
                    header,
                    remaining: header.length,
                };

                // Try to get the payload immediately.
                self.try_extract_one()
            }

            State::WaitingForPayload { header, remaining } => {
                let remaining = *remaining as usize;

                if self.buffer.len() < remaining {
                    return None;
                }

                let payload = self.buffer.split_to(remaining).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;

                Some(Self::finish(header, payload))
            }
        }
    }

    /// Turn a delimited header + payload into a unit, falling back to the
    /// raw bytes when the body does not parse.
    fn finish(header: FrameHeader, payload: Bytes) -> WireUnit {
        match Frame::from_wire(header, payload.clone()) {
            Ok(frame) => WireUnit::Frame(frame),
            Err(err) => {
                warn!(
                    kind = ?header.kind,
                    stream_id = header.stream_id,
                    %err,
                    "frame body failed to parse, relaying raw bytes"
                );
                let mut raw = BytesMut::with_capacity(HEADER_SIZE + payload.len());
                raw.extend_from_slice(&header.encode());
                raw.extend_from_slice(&payload);
                WireUnit::Malformed(raw.freeze())
            }
        }
    }

    /// Append data without extracting units.
    ///
    /// For callers that separate buffering from parsing; pair with
    /// [`FrameBuffer::next_unit`].
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete unit, or `None` while more data is
    /// needed.
    pub fn next_unit(&mut self) -> Option<WireUnit> {
        self.try_extract_one()
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
