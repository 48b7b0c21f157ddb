//! Per-stream reassembly of message-bearing frames.
//!
//! Frames for different streams interleave arbitrarily on the wire;
//! frames for the same stream arrive in order. The manager demultiplexes
//! by stream id and accumulates each stream's frames until one carries
//! the terminal flag, at which point the whole ordered sequence becomes
//! readable at once. Incomplete streams yield nothing: a logical message
//! is handed downstream either whole or not at all.
//!
//! One instance is owned by one direction of one connection. When an
//! incremental renderer observes a stream mid-flight it does so through
//! the peek accessors ([`StreamManager::frames`],
//! [`StreamManager::merge_payload`]), which leave the stream in place.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};

use super::MessageFrame;

#[derive(Debug, Default)]
struct StreamState {
    frames: Vec<MessageFrame>,
    complete: bool,
}

/// Demultiplexer for message-bearing frames, keyed by stream id.
#[derive(Debug, Default)]
pub struct StreamManager {
    streams: HashMap<u32, StreamState>,
    /// Stream ids in the order their terminal flag was observed.
    completed: VecDeque<u32>,
    /// One entry per written frame, in arrival order.
    arrivals: VecDeque<u32>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame to its stream.
    ///
    /// The terminal flag marks the stream complete; frames arriving
    /// after that (trailers) join the pending sequence until it is read.
    pub fn write(&mut self, frame: MessageFrame) {
        let id = frame.stream_id();
        let terminal = frame.is_end_stream();
        let state = self.streams.entry(id).or_default();
        state.frames.push(frame);
        self.arrivals.push_back(id);
        if terminal && !state.complete {
            state.complete = true;
            self.completed.push_back(id);
        }
    }

    /// Take the accumulated frame sequence for a stream.
    ///
    /// Returns `None` while the stream is missing or incomplete; the
    /// caller waits for more input. A successful read removes the
    /// stream, so each completed sequence is yielded exactly once.
    pub fn read(&mut self, stream_id: u32) -> Option<Vec<MessageFrame>> {
        if !self.is_complete(stream_id) {
            return None;
        }
        self.completed.retain(|id| *id != stream_id);
        self.arrivals.retain(|id| *id != stream_id);
        self.streams.remove(&stream_id).map(|state| state.frames)
    }

    /// Stream ids whose terminal flag has been seen, oldest first.
    pub fn complete_ids(&self) -> Vec<u32> {
        self.completed.iter().copied().collect()
    }

    /// Remove and return the oldest frame still held, across all streams.
    ///
    /// Drives incremental rendering of in-flight streams. A stream drained
    /// this way yields its remaining frames (possibly none) from
    /// [`StreamManager::read`] once complete; the two removal paths are
    /// alternatives, not meant to be mixed on one stream.
    pub fn pop_frame(&mut self) -> Option<MessageFrame> {
        while let Some(id) = self.arrivals.pop_front() {
            if let Some(state) = self.streams.get_mut(&id) {
                if !state.frames.is_empty() {
                    return Some(state.frames.remove(0));
                }
            }
        }
        None
    }

    /// Remove and return the oldest held frame of one stream, complete
    /// or not.
    pub fn pop_frame_for(&mut self, stream_id: u32) -> Option<MessageFrame> {
        let state = self.streams.get_mut(&stream_id)?;
        if state.frames.is_empty() {
            return None;
        }
        if let Some(pos) = self.arrivals.iter().position(|id| *id == stream_id) {
            self.arrivals.remove(pos);
        }
        Some(state.frames.remove(0))
    }

    /// Whether the stream has seen its terminal flag.
    pub fn is_complete(&self, stream_id: u32) -> bool {
        self.streams
            .get(&stream_id)
            .map_or(false, |state| state.complete)
    }

    /// Peek at the frames accumulated so far without removing them.
    pub fn frames(&self, stream_id: u32) -> Option<&[MessageFrame]> {
        self.streams
            .get(&stream_id)
            .map(|state| state.frames.as_slice())
    }

    /// Concatenated payload bytes of the frames accumulated so far.
    ///
    /// Peeks; usable for rendering a streaming response before the
    /// terminal flag arrives.
    pub fn merge_payload(&self, stream_id: u32) -> Option<Bytes> {
        let state = self.streams.get(&stream_id)?;
        let mut out = BytesMut::new();
        for frame in &state.frames {
            out.extend_from_slice(frame.frame.payload());
        }
        Some(out.freeze())
    }

    /// Drop a stream and anything accumulated for it.
    ///
    /// Used on stream reset and connection teardown.
    pub fn clear(&mut self, stream_id: u32) {
        self.completed.retain(|id| *id != stream_id);
        self.arrivals.retain(|id| *id != stream_id);
        self.streams.remove(&stream_id);
    }

    /// Number of streams currently holding frames.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
