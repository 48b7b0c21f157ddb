//! Frame classification and connection-control bookkeeping for one
//! direction of one connection.
//!
//! Bytes from the peer accumulate here unparsed until one of the two
//! readers runs the delimiter loop. Each parsed frame is dispatched by
//! kind: connection-level frames (settings, window updates, liveness
//! pings, the preface, resets) queue up for immediate relay and are
//! never shown to the operator; header- and data-bearing frames queue up
//! for stream reassembly. Classification is where the direction's
//! stateful side effects happen, in wire arrival order: header blocks
//! advance the compression context the moment their frame is parsed, and
//! settings and window updates feed the flow gate.
//!
//! The manager also owns the outbound side of the direction: re-encoded
//! wire bytes submitted through [`FrameManager::submit_outbound`] are
//! delimited again, window-gated, and staged for the hand-off queue.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use super::{FlowControlManager, MessageFrame};
use crate::hpack::table::DEFAULT_TABLE_SIZE;
use crate::hpack::{HpackDecoder, HpackEncoder, DEFAULT_MAX_HEADER_LIST_SIZE};
use crate::protocol::{
    Frame, FrameBuffer, FrameKind, Settings, WireUnit, PREFACE, SETTINGS_ACK,
};

/// Stream error codes that do not indicate a fault worth logging.
const ERROR_NO_ERROR: u32 = 0x0;
const ERROR_CANCEL: u32 = 0x8;

/// Per-direction frame pipeline: delimiting, classification, compression
/// context, flow gate.
pub struct FrameManager {
    inbound: FrameBuffer,
    control: VecDeque<WireUnit>,
    messages: VecDeque<MessageFrame>,
    decoder: HpackDecoder,
    encoder: HpackEncoder,
    flow: FlowControlManager,
    outbound: FrameBuffer,
    staged: BytesMut,
    seen_peer_settings: bool,
    sent_own_settings: bool,
    sent_settings_ack: bool,
    /// Set after a header block fails to decode: the table has diverged
    /// from the peer's, so later blocks are relayed raw instead of being
    /// misinterpreted. A fresh SETTINGS from the peer resets it together
    /// with the decoder.
    headers_poisoned: bool,
}

impl Default for FrameManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameManager {
    pub fn new() -> Self {
        Self {
            inbound: FrameBuffer::new(),
            control: VecDeque::new(),
            messages: VecDeque::new(),
            decoder: HpackDecoder::new(),
            encoder: HpackEncoder::new(),
            flow: FlowControlManager::new(),
            outbound: FrameBuffer::new(),
            staged: BytesMut::new(),
            seen_peer_settings: false,
            sent_own_settings: false,
            sent_settings_ack: false,
            headers_poisoned: false,
        }
    }

    /// Append raw bytes from the peer.
    ///
    /// Nothing is parsed here; the readers below drive the delimiter
    /// loop so classification side effects happen at a defined point.
    pub fn arrived(&mut self, data: &[u8]) {
        self.inbound.extend(data);
    }

    /// Drain connection-level frames for immediate relay.
    ///
    /// Runs the delimiter and classification loop over everything
    /// buffered, then returns the control units in arrival order. The
    /// preface and frames that failed to parse are included so the
    /// forwarding path can relay them unmodified.
    pub fn read_control_frames(&mut self) -> Vec<WireUnit> {
        self.drain_arrivals();
        self.control.drain(..).collect()
    }

    /// Drain message-bearing frames for stream reassembly.
    ///
    /// Same loop as [`FrameManager::read_control_frames`]; returns the
    /// headers and data frames instead. HEADERS frames carry their
    /// decoded header list when the compression context could interpret
    /// the block.
    pub fn read_message_frames(&mut self) -> Vec<MessageFrame> {
        self.drain_arrivals();
        self.messages.drain(..).collect()
    }

    /// Submit re-encoded wire bytes for transmission to the peer.
    ///
    /// The bytes are delimited into frames; data frames pass through the
    /// flow gate, everything else is staged directly. Released bytes are
    /// collected with [`FrameManager::take_staged`].
    pub fn submit_outbound(&mut self, data: &[u8]) {
        self.outbound.extend(data);
        while let Some(unit) = self.outbound.next_unit() {
            match unit {
                WireUnit::Preface => self.staged.extend_from_slice(PREFACE),
                WireUnit::Malformed(raw) => self.staged.extend_from_slice(&raw),
                WireUnit::Frame(frame) => {
                    let released = self.flow.write(&frame);
                    self.staged.extend_from_slice(&released);
                    if frame.kind() == FrameKind::Settings && !frame.is_ack() {
                        self.note_settings_sent();
                    }
                }
            }
        }
    }

    /// Record that this direction's own SETTINGS has gone out.
    ///
    /// Called by the gate when a SETTINGS frame transits it, and by the
    /// encoder when the connection prologue is emitted outside the gate.
    /// Completes the settings handshake: once both sides' SETTINGS have
    /// been seen, a single acknowledgement is staged.
    pub fn note_settings_sent(&mut self) {
        self.sent_own_settings = true;
        self.maybe_stage_settings_ack();
    }

    /// Take the wire bytes the gate has released since the last call.
    pub fn take_staged(&mut self) -> Option<Bytes> {
        if self.staged.is_empty() {
            None
        } else {
            Some(self.staged.split().freeze())
        }
    }

    /// Bytes buffered on the inbound side, not yet forming a frame.
    pub fn buffered_bytes(&self) -> usize {
        self.inbound.len()
    }

    /// The compression encoder for blocks this direction re-emits.
    pub fn hpack_encoder_mut(&mut self) -> &mut HpackEncoder {
        &mut self.encoder
    }

    /// The flow gate, for inspecting window and queue state.
    pub fn flow(&self) -> &FlowControlManager {
        &self.flow
    }

    fn drain_arrivals(&mut self) {
        while let Some(unit) = self.inbound.next_unit() {
            match unit {
                WireUnit::Frame(frame) => self.classify(frame),
                other => self.control.push_back(other),
            }
        }
    }

    fn classify(&mut self, frame: Frame) {
        if let Err(err) = frame.header().validate() {
            tracing::warn!(%err, "frame violates size rules, forwarding anyway");
        }
        match frame.kind() {
            FrameKind::Headers => {
                let headers = self.decode_header_block(&frame);
                self.messages.push_back(match headers {
                    Some(list) => MessageFrame::with_headers(frame, list),
                    None => MessageFrame::raw(frame),
                });
            }
            FrameKind::Data => self.messages.push_back(MessageFrame::raw(frame)),
            FrameKind::Settings => {
                self.apply_peer_settings(&frame);
                self.control.push_back(WireUnit::Frame(frame));
            }
            FrameKind::WindowUpdate => {
                self.apply_window_update(&frame);
                self.control.push_back(WireUnit::Frame(frame));
            }
            FrameKind::Goaway => {
                self.note_goaway(&frame);
                self.control.push_back(WireUnit::Frame(frame));
            }
            FrameKind::RstStream => {
                self.note_rst_stream(&frame);
                self.control.push_back(WireUnit::Frame(frame));
            }
            _ => self.control.push_back(WireUnit::Frame(frame)),
        }
    }

    fn decode_header_block(&mut self, frame: &Frame) -> Option<Vec<(String, String)>> {
        if self.headers_poisoned {
            return None;
        }
        match self.decoder.decode(frame.payload()) {
            Ok(list) => Some(list),
            Err(err) => {
                self.headers_poisoned = true;
                tracing::warn!(
                    stream_id = frame.stream_id(),
                    %err,
                    "header block not decodable, relaying raw blocks from here on"
                );
                None
            }
        }
    }

    fn apply_peer_settings(&mut self, frame: &Frame) {
        let settings = match Settings::parse(frame.payload()) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(%err, "unreadable SETTINGS payload, relaying uninterpreted");
                return;
            }
        };
        self.flow.apply_settings(&settings, frame.is_ack());
        if frame.is_ack() {
            return;
        }

        // The peer announced its table dimensions; restart the decoder
        // with them. Announcements arrive before any block they govern.
        let table_size = settings
            .header_table_size()
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_TABLE_SIZE);
        let list_size = settings
            .max_header_list_size()
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_HEADER_LIST_SIZE);
        self.decoder = HpackDecoder::with_limits(table_size, list_size);
        self.headers_poisoned = false;
        self.seen_peer_settings = true;
        self.maybe_stage_settings_ack();
    }

    fn apply_window_update(&mut self, frame: &Frame) {
        let payload = frame.payload();
        if payload.len() != 4 {
            tracing::warn!(
                len = payload.len(),
                "WINDOW_UPDATE with unexpected payload size, relaying uninterpreted"
            );
            return;
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
        let released = self.flow.add_window(frame.stream_id(), increment);
        self.staged.extend_from_slice(&released);
    }

    fn note_goaway(&self, frame: &Frame) {
        let payload = frame.payload();
        if payload.len() < 8 {
            return;
        }
        let last_stream_id =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
        let error_code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        if error_code != ERROR_NO_ERROR {
            tracing::warn!(error_code, last_stream_id, "peer sent GOAWAY with error");
        }
    }

    fn note_rst_stream(&self, frame: &Frame) {
        let payload = frame.payload();
        if payload.len() < 4 {
            return;
        }
        let error_code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if error_code != ERROR_NO_ERROR && error_code != ERROR_CANCEL {
            tracing::warn!(
                stream_id = frame.stream_id(),
                error_code,
                "stream reset with error"
            );
        }
    }

    fn maybe_stage_settings_ack(&mut self) {
        if self.sent_own_settings && self.seen_peer_settings && !self.sent_settings_ack {
            self.staged.extend_from_slice(&SETTINGS_ACK);
            self.sent_settings_ack = true;
        }
    }
}
