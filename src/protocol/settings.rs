//! SETTINGS payload parsing and construction.
//!
//! A SETTINGS payload is a sequence of 6-byte entries, each a 16-bit
//! identifier followed by a 32-bit value, both big-endian. The manager
//! reads a handful of them (header table sizing for the compression
//! context, initial window size for flow control) and relays the frame
//! regardless, so parsing here is interpretation only and never blocks
//! forwarding.

use bytes::{BufMut, Bytes, BytesMut};

use super::Frame;
use crate::error::{Result, TapwireError};

/// Setting identifiers defined for the multiplexed transport.
pub mod setting_id {
    /// Maximum size of the peer's header compression table.
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    /// Whether the peer accepts pushed streams.
    pub const ENABLE_PUSH: u16 = 0x2;
    /// How many streams the sender allows concurrently.
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    /// Initial per-stream flow-control window.
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    /// Largest frame payload the sender accepts.
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    /// Advisory cap on the decoded size of a header list.
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// Size of one settings entry on the wire.
pub const SETTING_ENTRY_SIZE: usize = 6;

/// A parsed SETTINGS payload.
///
/// Entries keep their wire order, including duplicates and identifiers we
/// do not recognise, so re-encoding reproduces the original payload. The
/// typed accessors apply last-occurrence-wins, matching how receivers are
/// required to process the list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: Vec<(u16, u32)>,
}

impl Settings {
    /// Create an empty settings list.
    pub fn new() -> Self {
        Self::default()
    }

    /// The settings this proxy announces on each intercepted connection:
    /// generous stream and window limits so neither peer stalls on us, and
    /// push disabled because pushed streams would bypass interception.
    pub fn proxy_defaults() -> Self {
        let mut settings = Self::new();
        settings.set(setting_id::MAX_CONCURRENT_STREAMS, 1000);
        settings.set(setting_id::INITIAL_WINDOW_SIZE, 0x5fff_ffff);
        settings.set(setting_id::ENABLE_PUSH, 0);
        settings
    }

    /// Parse a SETTINGS frame payload.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the payload is not a whole number of
    /// entries. The caller logs and relays the frame uninterpreted.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() % SETTING_ENTRY_SIZE != 0 {
            return Err(TapwireError::Protocol(format!(
                "SETTINGS payload of {} bytes is not a multiple of {}",
                payload.len(),
                SETTING_ENTRY_SIZE
            )));
        }
        let entries = payload
            .chunks_exact(SETTING_ENTRY_SIZE)
            .map(|entry| {
                let id = u16::from_be_bytes([entry[0], entry[1]]);
                let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
                (id, value)
            })
            .collect();
        Ok(Self { entries })
    }

    /// Append an entry, keeping any earlier entry for the same id.
    pub fn set(&mut self, id: u16, value: u32) {
        self.entries.push((id, value));
    }

    /// Look up a setting. The last occurrence wins.
    pub fn get(&self, id: u16) -> Option<u32> {
        self.entries
            .iter()
            .rev()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, value)| *value)
    }

    /// Header compression table size, if announced.
    #[inline]
    pub fn header_table_size(&self) -> Option<u32> {
        self.get(setting_id::HEADER_TABLE_SIZE)
    }

    /// Header list size cap, if announced.
    #[inline]
    pub fn max_header_list_size(&self) -> Option<u32> {
        self.get(setting_id::MAX_HEADER_LIST_SIZE)
    }

    /// Initial per-stream window, if announced.
    #[inline]
    pub fn initial_window_size(&self) -> Option<u32> {
        self.get(setting_id::INITIAL_WINDOW_SIZE)
    }

    /// Largest accepted frame payload, if announced.
    #[inline]
    pub fn max_frame_size(&self) -> Option<u32> {
        self.get(setting_id::MAX_FRAME_SIZE)
    }

    /// Number of entries, counting duplicates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u32)> + '_ {
        self.entries.iter().copied()
    }

    /// Encode the entries back into a payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.entries.len() * SETTING_ENTRY_SIZE);
        for (id, value) in &self.entries {
            buf.put_u16(*id);
            buf.put_u32(*value);
        }
        buf.freeze()
    }

    /// Wrap the entries in a SETTINGS frame on stream 0.
    pub fn to_frame(&self) -> Frame {
        Frame::settings(self.encode())
    }
}
