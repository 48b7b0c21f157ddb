//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary multiplexed transport as seen on the
//! wire:
//! - 9-byte header encoding/decoding and the connection preface
//! - Delimiter detection over partial buffers
//! - Frame buffer for accumulating fragmented reads
//! - Frame struct with typed accessors
//! - SETTINGS payload interpretation

mod frame;
mod frame_buffer;
pub mod settings;
pub mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::{FrameBuffer, WireUnit};
pub use settings::Settings;
pub use wire_format::{
    check_delimiter, decode_frame_header, encode_frame_header, flags, is_preface, FrameHeader,
    FrameKind, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAX_DECLARED_PAYLOAD, PREFACE,
    PROLOGUE_SETTINGS, PROLOGUE_WINDOW_UPDATE, SETTINGS_ACK, STREAM_ID_MASK,
};
