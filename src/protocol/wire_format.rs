//! Wire format encoding and decoding.
//!
//! Implements the 9-byte frame header used by stream-multiplexed binary
//! framing (HTTP/2-class):
//! ```text
//! ┌──────────┬────────┬────────┬─────────────┐
//! │ Length   │ Type   │ Flags  │ Stream ID   │
//! │ 3 bytes  │ 1 byte │ 1 byte │ 4 bytes     │
//! │ u24 BE   │        │        │ u31 BE      │
//! └──────────┴────────┴────────┴─────────────┘
//! ```
//!
//! The top bit of the stream id is reserved and masked off on decode.
//! All multi-byte integers are Big Endian.

use crate::error::{Result, TapwireError};

/// Frame header size in bytes (fixed, exactly 9).
pub const HEADER_SIZE: usize = 9;

/// Largest payload the 3-byte length field can declare.
pub const MAX_DECLARED_PAYLOAD: u32 = 0x00FF_FFFF;

/// Default maximum payload accepted from a peer (the protocol's default
/// max frame size).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16_384;

/// Mask clearing the reserved top bit of a stream id.
pub const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// Fixed connection preface a client sends before its first frame.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Prologue SETTINGS frame emitted once per direction:
/// max concurrent streams 1000, initial window 0x5fffffff, push disabled.
pub const PROLOGUE_SETTINGS: [u8; 27] = [
    0x00, 0x00, 0x12, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, // len=18 SETTINGS stream=0
    0x00, 0x03, 0x00, 0x00, 0x03, 0xe8, // MAX_CONCURRENT_STREAMS = 1000
    0x00, 0x04, 0x5f, 0xff, 0xff, 0xff, // INITIAL_WINDOW_SIZE = 0x5fffffff
    0x00, 0x02, 0x00, 0x00, 0x00, 0x00, // ENABLE_PUSH = 0
];

/// Empty SETTINGS frame with the ACK flag set.
pub const SETTINGS_ACK: [u8; 9] = [0x00, 0x00, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00];

/// Prologue WINDOW_UPDATE crediting the connection window by 0x5fffffff.
pub const PROLOGUE_WINDOW_UPDATE: [u8; 13] = [
    0x00, 0x00, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x5f, 0xff, 0xff, 0xff,
];

/// Flag constants for the frame header flags byte.
pub mod flags {
    /// End of stream (DATA, HEADERS): terminal frame for this stream id.
    pub const END_STREAM: u8 = 0x01;
    /// Acknowledgement (SETTINGS, PING).
    pub const ACK: u8 = 0x01;
    /// End of the header block (HEADERS, CONTINUATION).
    pub const END_HEADERS: u8 = 0x04;
    /// Payload carries a pad-length prefix and trailing padding.
    pub const PADDED: u8 = 0x08;
    /// HEADERS payload starts with priority fields.
    pub const PRIORITY: u8 = 0x20;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Frame type, as carried in the header type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    Altsvc,
    Origin,
    /// A type byte this implementation does not know. Carried through
    /// unmodified so unknown frames are forwarded, never dropped.
    Unknown(u8),
}

impl FrameKind {
    /// Map a wire type byte to a kind.
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0x0 => FrameKind::Data,
            0x1 => FrameKind::Headers,
            0x2 => FrameKind::Priority,
            0x3 => FrameKind::RstStream,
            0x4 => FrameKind::Settings,
            0x5 => FrameKind::PushPromise,
            0x6 => FrameKind::Ping,
            0x7 => FrameKind::Goaway,
            0x8 => FrameKind::WindowUpdate,
            0x9 => FrameKind::Continuation,
            0xa => FrameKind::Altsvc,
            0xc => FrameKind::Origin,
            other => FrameKind::Unknown(other),
        }
    }

    /// Map a kind back to its wire type byte.
    pub fn as_u8(&self) -> u8 {
        match self {
            FrameKind::Data => 0x0,
            FrameKind::Headers => 0x1,
            FrameKind::Priority => 0x2,
            FrameKind::RstStream => 0x3,
            FrameKind::Settings => 0x4,
            FrameKind::PushPromise => 0x5,
            FrameKind::Ping => 0x6,
            FrameKind::Goaway => 0x7,
            FrameKind::WindowUpdate => 0x8,
            FrameKind::Continuation => 0x9,
            FrameKind::Altsvc => 0xa,
            FrameKind::Origin => 0xc,
            FrameKind::Unknown(other) => *other,
        }
    }

    /// Message-bearing kinds are buffered for stream reassembly; every
    /// other kind is connection-level control and forwarded immediately.
    #[inline]
    pub fn is_message_bearing(&self) -> bool {
        matches!(self, FrameKind::Headers | FrameKind::Data)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes (24-bit on the wire).
    pub length: u32,
    /// Frame type.
    pub kind: FrameKind,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Stream identifier (31-bit; 0 = connection-level).
    pub stream_id: u32,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(kind: FrameKind, flags: u8, stream_id: u32, length: u32) -> Self {
        Self {
            length,
            kind,
            flags,
            stream_id: stream_id & STREAM_ID_MASK,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use tapwire::protocol::{FrameHeader, FrameKind, flags};
    ///
    /// let header = FrameHeader::new(FrameKind::Data, flags::END_STREAM, 1, 5);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 9);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (9 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = ((self.length >> 16) & 0xff) as u8;
        buf[1] = ((self.length >> 8) & 0xff) as u8;
        buf[2] = (self.length & 0xff) as u8;
        buf[3] = self.kind.as_u8();
        buf[4] = self.flags;
        buf[5..9].copy_from_slice(&(self.stream_id & STREAM_ID_MASK).to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use tapwire::protocol::{FrameHeader, FrameKind};
    ///
    /// let bytes = [0x00, 0x00, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];
    /// let header = FrameHeader::decode(&bytes).unwrap();
    /// assert_eq!(header.kind, FrameKind::Data);
    /// assert_eq!(header.length, 5);
    /// assert_eq!(header.stream_id, 1);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: (buf[0] as u32) << 16 | (buf[1] as u32) << 8 | buf[2] as u32,
            kind: FrameKind::from_u8(buf[3]),
            flags: buf[4],
            stream_id: u32::from_be_bytes([buf[5] & 0x7f, buf[6], buf[7], buf[8]]),
        })
    }

    /// Validate size and stream-id rules for the known frame kinds.
    ///
    /// A failed validation does not abort anything by itself: the frame
    /// manager logs the anomaly and still forwards the frame, so a live
    /// connection is never truncated by a frame we merely fail to
    /// understand.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            FrameKind::Ping => {
                if self.length != 8 || self.stream_id != 0 {
                    return Err(TapwireError::Protocol(format!(
                        "PING must carry 8 payload bytes on stream 0, got len={} stream={}",
                        self.length, self.stream_id
                    )));
                }
            }
            FrameKind::RstStream => {
                if self.length != 4 || self.stream_id == 0 {
                    return Err(TapwireError::Protocol(format!(
                        "RST_STREAM must carry 4 payload bytes on a non-zero stream, got len={} stream={}",
                        self.length, self.stream_id
                    )));
                }
            }
            FrameKind::Settings => {
                if self.stream_id != 0 || self.length % 6 != 0 {
                    return Err(TapwireError::Protocol(format!(
                        "SETTINGS must be a multiple of 6 bytes on stream 0, got len={} stream={}",
                        self.length, self.stream_id
                    )));
                }
            }
            FrameKind::WindowUpdate => {
                if self.length != 4 {
                    return Err(TapwireError::Protocol(format!(
                        "WINDOW_UPDATE must carry 4 payload bytes, got len={}",
                        self.length
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Check if the terminal (end-of-stream) flag is set.
    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.kind.is_message_bearing() && flags::has_flag(self.flags, flags::END_STREAM)
    }

    /// Check if this is a SETTINGS/PING acknowledgement.
    #[inline]
    pub fn is_ack(&self) -> bool {
        matches!(self.kind, FrameKind::Settings | FrameKind::Ping)
            && flags::has_flag(self.flags, flags::ACK)
    }

    /// Check if this is a connection-level frame (stream id 0).
    #[inline]
    pub fn is_connection_level(&self) -> bool {
        self.stream_id == 0
    }
}

/// Check whether the buffer starts with the full connection preface.
#[inline]
pub fn is_preface(buf: &[u8]) -> bool {
    buf.len() >= PREFACE.len() && &buf[..PREFACE.len()] == PREFACE
}

/// Delimiter detector for length-prefixed binary framing.
///
/// Returns the number of leading bytes forming one complete protocol unit
/// (frame header + declared payload, or the 24-byte preface), or `None`
/// when more bytes are needed. Never reads past the buffer; repeated calls
/// on a growing prefix are stable.
///
/// # Example
///
/// ```
/// use tapwire::protocol::check_delimiter;
///
/// let frame = [0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xAA, 0xBB];
/// assert_eq!(check_delimiter(&frame), Some(11));
/// assert_eq!(check_delimiter(&frame[..10]), None);
/// ```
pub fn check_delimiter(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    if is_preface(buf) {
        return Some(PREFACE.len());
    }
    let payload_size = (buf[0] as usize) << 16 | (buf[1] as usize) << 8 | buf[2] as usize;
    let expected = HEADER_SIZE + payload_size;
    if buf.len() < expected {
        return None;
    }
    Some(expected)
}

/// Decode a frame header from bytes (standalone function).
#[inline]
pub fn decode_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    FrameHeader::decode(buf)
}

/// Encode a frame header to bytes (standalone function).
#[inline]
pub fn encode_frame_header(header: &FrameHeader) -> [u8; HEADER_SIZE] {
    header.encode()
}
