//! Multiplexed-stream machinery for one direction of one connection.
//!
//! Three pieces cooperate here, each owned by exactly one direction:
//!
//! ```text
//! arrived bytes ──► FrameManager ──► control frames (relayed immediately)
//!                        │
//!                        └─► message frames ──► StreamManager ──► completed
//!                                                                 streams
//! re-encoded frames ──► FlowControlManager ──► window-gated wire bytes
//! ```
//!
//! [`FrameManager`] delimits and classifies arriving frames and owns the
//! direction's header-compression contexts. [`StreamManager`] reassembles
//! message-bearing frames per stream until the terminal flag. The flow
//! control types gate re-emitted data frames against the peer's window
//! credits.
//!
//! Nothing in this module is shared across connections.

mod flow_control;
mod frame_manager;
mod stream_manager;

pub use flow_control::{FlowControlManager, DEFAULT_WINDOW_SIZE};
pub use frame_manager::FrameManager;
pub use stream_manager::StreamManager;

use crate::protocol::Frame;

/// A message-bearing frame on its way to stream reassembly.
///
/// HEADERS frames carry the header list decoded at parse time, in
/// network arrival order; the compression context has already advanced
/// past this frame. `headers` is `None` for DATA frames and for header
/// blocks the decoder could not interpret (the raw block stays in the
/// frame payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub frame: Frame,
    pub headers: Option<Vec<(String, String)>>,
}

impl MessageFrame {
    /// Wrap a frame that carries no decoded header list.
    pub fn raw(frame: Frame) -> Self {
        Self {
            frame,
            headers: None,
        }
    }

    /// Wrap a HEADERS frame together with its decoded header list.
    pub fn with_headers(frame: Frame, headers: Vec<(String, String)>) -> Self {
        Self {
            frame,
            headers: Some(headers),
        }
    }

    /// Stream this frame belongs to.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.frame.stream_id()
    }

    /// Whether the terminal flag is set.
    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.frame.is_end_stream()
    }
}
