//! Window-gated emission of re-encoded frames.
//!
//! Data frames headed back to the wire cannot simply be written out:
//! the receiving peer grants transmission credit through window
//! updates, per stream and for the connection as a whole. The manager
//! holds queued data bytes per stream and releases them as credit
//! allows, re-chunked into data frames no larger than the default
//! payload limit. Non-data frames are not subject to windows and pass
//! straight through.
//!
//! Callers collect the returned wire bytes and push them into the
//! direction's hand-off queue; nothing is written here directly.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::protocol::{flags, Frame, FrameKind, Settings, DEFAULT_MAX_PAYLOAD_SIZE};

/// Initial window size for the connection and for each new stream,
/// until the peer announces a different one.
pub const DEFAULT_WINDOW_SIZE: u64 = 65_535;

/// Per-stream transmission state: remaining credit plus queued bytes.
#[derive(Debug)]
struct FlowControl {
    stream_id: u32,
    window: u64,
    queue: BytesMut,
    end_flag: bool,
}

impl FlowControl {
    fn new(stream_id: u32, initial_window: u64) -> Self {
        Self {
            stream_id,
            window: initial_window,
            queue: BytesMut::new(),
            end_flag: false,
        }
    }

    fn add_window(&mut self, increment: u32) {
        self.window = self.window.saturating_add(u64::from(increment));
    }

    /// Queue a data frame's payload. The terminal flag is remembered and
    /// re-attached to the last chunk that drains the queue.
    fn enqueue(&mut self, frame: &Frame) {
        self.queue.extend_from_slice(frame.payload());
        if frame.is_end_stream() {
            self.end_flag = true;
        }
    }

    /// Release as much queued data as current credit allows.
    ///
    /// Returns `None` when nothing can be sent. Emitted frames carry at
    /// most [`DEFAULT_MAX_PAYLOAD_SIZE`] bytes each; the terminal flag
    /// goes on the final chunk only if the queue fully drained.
    fn dequeue(&mut self, connection_window: u64) -> Option<Vec<Frame>> {
        let capacity = self.window.min(connection_window);
        if capacity == 0 {
            if !self.queue.is_empty() {
                tracing::warn!(
                    stream_id = self.stream_id,
                    queued = self.queue.len(),
                    "flow-control window exhausted, data held back"
                );
            }
            return None;
        }

        let take = (self.queue.len() as u64).min(capacity) as usize;
        if take == 0 {
            return None;
        }
        self.window -= take as u64;

        let mut data = self.queue.split_to(take);
        let drained = self.queue.is_empty();
        let mut frames = Vec::new();
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(DEFAULT_MAX_PAYLOAD_SIZE as usize));
            let last = data.is_empty();
            let frame_flags = if last && drained && self.end_flag {
                flags::END_STREAM
            } else {
                0
            };
            frames.push(Frame::data(self.stream_id, frame_flags, chunk.freeze()));
        }
        Some(frames)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Connection-wide flow gate for one direction's outbound frames.
#[derive(Debug)]
pub struct FlowControlManager {
    flows: HashMap<u32, FlowControl>,
    connection_window: u64,
    initial_stream_window: u64,
}

impl Default for FlowControlManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControlManager {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
            connection_window: DEFAULT_WINDOW_SIZE,
            initial_stream_window: DEFAULT_WINDOW_SIZE,
        }
    }

    /// Submit a frame for emission.
    ///
    /// Non-data frames serialize immediately. Data frames are queued on
    /// their stream and released as window credit allows; the returned
    /// bytes may therefore be empty, cover only part of the payload, or
    /// include previously queued data.
    pub fn write(&mut self, frame: &Frame) -> Bytes {
        let mut out = BytesMut::new();
        if frame.kind() == FrameKind::Data {
            self.flow_mut(frame.stream_id()).enqueue(frame);
            self.drain_flow(frame.stream_id(), &mut out);
        } else {
            out.extend_from_slice(&frame.serialize());
        }
        out.freeze()
    }

    /// Apply a credit grant from the peer.
    ///
    /// Stream id 0 credits the shared connection window and retries
    /// every stream with queued data; any other id credits that stream
    /// alone. Returns the wire bytes the new credit released.
    pub fn add_window(&mut self, stream_id: u32, increment: u32) -> Bytes {
        let mut out = BytesMut::new();
        if stream_id == 0 {
            self.connection_window = self.connection_window.saturating_add(u64::from(increment));
            let mut ids: Vec<u32> = self.flows.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                self.drain_flow(id, &mut out);
            }
        } else {
            self.flow_mut(stream_id).add_window(increment);
            self.drain_flow(stream_id, &mut out);
        }
        out.freeze()
    }

    /// Record the peer's announced initial window size.
    ///
    /// Acknowledgement frames carry no entries and are ignored. The new
    /// size applies to streams opened afterwards; windows of streams
    /// already open keep their current credit.
    pub fn apply_settings(&mut self, settings: &Settings, is_ack: bool) {
        if is_ack {
            return;
        }
        if self.initial_stream_window != DEFAULT_WINDOW_SIZE {
            tracing::warn!(
                current = self.initial_stream_window,
                "initial window size re-announced, existing streams keep their credit"
            );
        }
        self.initial_stream_window = u64::from(
            settings
                .initial_window_size()
                .unwrap_or(DEFAULT_WINDOW_SIZE as u32),
        );
    }

    /// Remaining connection-level credit.
    pub fn connection_window(&self) -> u64 {
        self.connection_window
    }

    /// Bytes queued for a stream, waiting on credit.
    pub fn queued(&self, stream_id: u32) -> usize {
        self.flows.get(&stream_id).map_or(0, FlowControl::queued)
    }

    /// Total bytes queued across all streams.
    pub fn queued_total(&self) -> usize {
        self.flows.values().map(FlowControl::queued).sum()
    }

    fn flow_mut(&mut self, stream_id: u32) -> &mut FlowControl {
        let initial = self.initial_stream_window;
        self.flows
            .entry(stream_id)
            .or_insert_with(|| FlowControl::new(stream_id, initial))
    }

    fn drain_flow(&mut self, stream_id: u32, out: &mut BytesMut) {
        let connection_window = self.connection_window;
        let Some(flow) = self.flows.get_mut(&stream_id) else {
            return;
        };
        let Some(frames) = flow.dequeue(connection_window) else {
            return;
        };
        for frame in &frames {
            self.connection_window -= frame.payload_len() as u64;
            out.extend_from_slice(&frame.serialize());
        }
    }
}
