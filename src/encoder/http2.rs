//! HTTP/2 encoder.
//!
//! A unit is one complete stream: every message-bearing frame from the
//! first HEADERS through the frame that sets END_STREAM. Control frames
//! never wait for the operator; [`Http2Encoder::pass_through`] relays
//! them as soon as they parse, interleaved with the connection prologue
//! and whatever the outbound flow-control gate releases.
//!
//! The stream table can be shared with a display task through
//! [`Http2Encoder::stream_handle`]; the encoder holds the lock only for
//! short synchronous sections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};

use crate::encoder::{Encoder, Framing, LogicalMessage, Role};
use crate::error::{Result, TapwireError};
use crate::mux::{FrameManager, MessageFrame, StreamManager};
use crate::protocol::{
    check_delimiter, flags, Frame, FrameBuffer, FrameHeader, FrameKind, WireUnit,
    DEFAULT_MAX_PAYLOAD_SIZE, PREFACE, PROLOGUE_SETTINGS, PROLOGUE_WINDOW_UPDATE,
};

/// Stream-multiplexed frame encoder for HTTP/2 endpoints.
pub struct Http2Encoder {
    role: Role,
    manager: FrameManager,
    streams: Arc<Mutex<StreamManager>>,
    /// Reassembled frames of units handed out by `available`, keyed by
    /// stream id, kept until `decode` consumes them. Header blocks are
    /// decoded exactly once, at parse time; this carries the result
    /// across the byte-shaped seam between the two calls.
    pending: HashMap<u32, Vec<MessageFrame>>,
    sent_prologue: bool,
    max_data_payload: usize,
}

/// Builder for an [`Http2Encoder`].
pub struct Http2Builder {
    role: Role,
    streams: Option<Arc<Mutex<StreamManager>>>,
    max_data_payload: usize,
}

impl Http2Builder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            streams: None,
            max_data_payload: DEFAULT_MAX_PAYLOAD_SIZE as usize,
        }
    }

    /// Share an existing stream table instead of creating a fresh one.
    pub fn streams(mut self, streams: Arc<Mutex<StreamManager>>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Cap re-encoded DATA frames at `size` bytes of payload.
    pub fn max_data_payload(mut self, size: usize) -> Self {
        self.max_data_payload = size;
        self
    }

    pub fn build(self) -> Http2Encoder {
        Http2Encoder {
            role: self.role,
            manager: FrameManager::new(),
            streams: self
                .streams
                .unwrap_or_else(|| Arc::new(Mutex::new(StreamManager::new()))),
            pending: HashMap::new(),
            sent_prologue: false,
            max_data_payload: self.max_data_payload,
        }
    }
}

impl Http2Encoder {
    pub fn new(role: Role) -> Self {
        Self::builder(role).build()
    }

    pub fn builder(role: Role) -> Http2Builder {
        Http2Builder::new(role)
    }

    /// Handle to the stream table, for a display task that wants to peek
    /// at partially reassembled streams.
    pub fn stream_handle(&self) -> Arc<Mutex<StreamManager>> {
        Arc::clone(&self.streams)
    }

    fn lock_streams(&self) -> Result<MutexGuard<'_, StreamManager>> {
        self.streams
            .lock()
            .map_err(|_| TapwireError::Protocol("stream table lock poisoned".into()))
    }

    /// Connection prologue for this direction's role.
    ///
    /// Client-facing directions open with the connection preface; both
    /// roles follow with the proxy's SETTINGS and the connection-window
    /// enlargement.
    fn prologue(&self) -> Bytes {
        let mut out = BytesMut::new();
        if matches!(self.role, Role::ProxyClient | Role::ResendClient) {
            out.extend_from_slice(PREFACE);
        }
        out.extend_from_slice(&PROLOGUE_SETTINGS);
        out.extend_from_slice(&PROLOGUE_WINDOW_UPDATE);
        out.freeze()
    }

    fn build_message(&self, data: &[u8], frames: Vec<MessageFrame>) -> LogicalMessage {
        let mut headers = Vec::new();
        let mut body = BytesMut::new();
        let mut stream_id = 0;
        let mut end_stream = false;
        for frame in &frames {
            stream_id = frame.stream_id();
            end_stream |= frame.is_end_stream();
            match frame.frame.kind() {
                FrameKind::Headers | FrameKind::Continuation => match &frame.headers {
                    Some(list) => headers.extend(list.iter().cloned()),
                    // The block never decoded; the unit is only safe to
                    // relay verbatim.
                    None => return LogicalMessage::raw(Bytes::copy_from_slice(data)),
                },
                FrameKind::Data => body.extend_from_slice(frame.frame.payload()),
                _ => {}
            }
        }
        LogicalMessage {
            stream_id,
            end_stream,
            headers,
            body: body.freeze(),
            framing: Framing::Http2,
        }
    }
}

impl Encoder for Http2Encoder {
    fn name(&self) -> &'static str {
        "http/2"
    }

    fn check_delimiter(&self, buf: &[u8]) -> Result<Option<usize>> {
        Ok(check_delimiter(buf))
    }

    fn arrived(&mut self, data: &[u8]) -> Result<()> {
        self.manager.arrived(data);
        Ok(())
    }

    fn pass_through(&mut self) -> Result<Option<Bytes>> {
        let mut out = BytesMut::new();
        if !self.sent_prologue {
            out.extend_from_slice(&self.prologue());
            self.manager.note_settings_sent();
            self.sent_prologue = true;
        }
        for unit in self.manager.read_control_frames() {
            match unit {
                // The destination already received our own preface.
                WireUnit::Preface => {
                    tracing::debug!("discarding inbound connection preface")
                }
                WireUnit::Frame(frame) => out.extend_from_slice(&frame.serialize()),
                WireUnit::Malformed(raw) => out.extend_from_slice(&raw),
            }
        }
        if let Some(staged) = self.manager.take_staged() {
            out.extend_from_slice(&staged);
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out.freeze()))
        }
    }

    fn available(&mut self) -> Result<Option<Bytes>> {
        let frames = self.manager.read_message_frames();
        if !frames.is_empty() {
            let mut streams = self.lock_streams()?;
            for frame in frames {
                streams.write(frame);
            }
        }
        let completed = {
            let streams = self.lock_streams()?;
            streams.complete_ids().first().copied()
        };
        let Some(stream_id) = completed else {
            return Ok(None);
        };
        let Some(frames) = self.lock_streams()?.read(stream_id) else {
            return Ok(None);
        };
        let mut unit = BytesMut::new();
        for frame in &frames {
            unit.extend_from_slice(&frame.frame.serialize());
        }
        self.pending.insert(stream_id, frames);
        Ok(Some(unit.freeze()))
    }

    fn decode(&mut self, data: &[u8]) -> Result<LogicalMessage> {
        let Some(header) = FrameHeader::decode(data) else {
            return Ok(LogicalMessage::raw(Bytes::copy_from_slice(data)));
        };
        if let Some(frames) = self.pending.remove(&header.stream_id) {
            return Ok(self.build_message(data, frames));
        }
        // Not a unit this encoder handed out. Reparse; header blocks
        // cannot be re-decoded (the compression context has moved on),
        // so anything carrying one stays raw.
        let mut buffer = FrameBuffer::new();
        buffer.push(data);
        let mut frames = Vec::new();
        while let Some(unit) = buffer.next_unit() {
            match unit {
                WireUnit::Frame(frame)
                    if matches!(frame.kind(), FrameKind::Data) =>
                {
                    frames.push(MessageFrame::raw(frame));
                }
                _ => return Ok(LogicalMessage::raw(Bytes::copy_from_slice(data))),
            }
        }
        if frames.is_empty() {
            return Ok(LogicalMessage::raw(Bytes::copy_from_slice(data)));
        }
        Ok(self.build_message(data, frames))
    }

    fn encode(&mut self, message: LogicalMessage) -> Result<Bytes> {
        match message.framing {
            Framing::Http2 => {}
            Framing::Raw => {
                self.manager.submit_outbound(&message.body);
                return Ok(self.manager.take_staged().unwrap_or_default());
            }
            other => {
                return Err(TapwireError::Encode(format!(
                    "message framed as {other:?} cannot be serialized as http/2"
                )))
            }
        }

        let block = self.manager.hpack_encoder_mut().encode(&message.headers);
        let mut header_flags = flags::END_HEADERS;
        if message.end_stream && message.body.is_empty() {
            header_flags |= flags::END_STREAM;
        }
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&Frame::headers(message.stream_id, header_flags, block).try_serialize()?);

        if !message.body.is_empty() {
            let chunks: Vec<&[u8]> = message.body.chunks(self.max_data_payload).collect();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let data_flags = if i == last && message.end_stream {
                    flags::END_STREAM
                } else {
                    0
                };
                let frame = Frame::data(
                    message.stream_id,
                    data_flags,
                    Bytes::copy_from_slice(chunk),
                );
                wire.extend_from_slice(&frame.try_serialize()?);
            }
        }

        self.manager.submit_outbound(&wire);
        Ok(self.manager.take_staged().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, settings::setting_id, Settings, SETTINGS_ACK};

    /// Literal header field with incremental indexing:
    /// `custom-key: custom-header`.
    const LITERAL_BLOCK: &[u8] = &[
        0x40, 0x0a, 0x63, 0x75, 0x73, 0x74, 0x6f, 0x6d, 0x2d, 0x6b, 0x65, 0x79, 0x0d, 0x63,
        0x75, 0x73, 0x74, 0x6f, 0x6d, 0x2d, 0x68, 0x65, 0x61, 0x64, 0x65, 0x72,
    ];

    fn parse_frames(data: &[u8]) -> Vec<Frame> {
        let mut buffer = FrameBuffer::new();
        buffer.extend(data);
        let mut frames = Vec::new();
        while let Some(unit) = buffer.next_unit() {
            match unit {
                WireUnit::Frame(frame) => frames.push(frame),
                other => panic!("unexpected unit: {other:?}"),
            }
        }
        frames
    }

    fn drain_prologue(enc: &mut Http2Encoder) {
        enc.pass_through().unwrap().expect("prologue");
    }

    #[test]
    fn test_prologue_per_role() {
        let mut client = Http2Encoder::new(Role::ProxyClient);
        let out = client.pass_through().unwrap().expect("client prologue");
        assert!(out.starts_with(PREFACE));
        assert_eq!(&out[PREFACE.len()..PREFACE.len() + 27], &PROLOGUE_SETTINGS[..]);
        assert!(out.ends_with(&PROLOGUE_WINDOW_UPDATE));
        assert_eq!(client.pass_through().unwrap(), None);

        let mut server = Http2Encoder::new(Role::ProxyServer);
        let out = server.pass_through().unwrap().expect("server prologue");
        assert!(out.starts_with(&PROLOGUE_SETTINGS));
        assert!(out.ends_with(&PROLOGUE_WINDOW_UPDATE));

        let mut resend = Http2Encoder::new(Role::ResendClient);
        let out = resend.pass_through().unwrap().expect("resend prologue");
        assert!(out.starts_with(PREFACE));
    }

    #[test]
    fn test_inbound_preface_is_not_echoed() {
        let mut enc = Http2Encoder::new(Role::ProxyClient);
        drain_prologue(&mut enc);
        enc.arrived(PREFACE).unwrap();
        assert_eq!(enc.pass_through().unwrap(), None);
    }

    #[test]
    fn test_control_frames_relay_through_pass_through() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        drain_prologue(&mut enc);

        let ping = build_frame(FrameKind::Ping, 0, 0, &[7u8; 8]);
        enc.arrived(&ping).unwrap();
        let out = enc.pass_through().unwrap().expect("relayed ping");
        assert_eq!(&out[..], &ping[..]);
        assert_eq!(enc.available().unwrap(), None);
    }

    #[test]
    fn test_peer_settings_answered_with_ack() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        drain_prologue(&mut enc);

        let mut settings = Settings::new();
        settings.set(setting_id::MAX_CONCURRENT_STREAMS, 77);
        let frame = settings.to_frame().serialize();
        enc.arrived(&frame).unwrap();

        let out = enc.pass_through().unwrap().expect("settings relay");
        assert!(out.starts_with(&frame));
        assert!(out.ends_with(&SETTINGS_ACK));
    }

    #[test]
    fn test_available_waits_for_terminal_flag() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        let headers = build_frame(FrameKind::Headers, flags::END_HEADERS, 1, LITERAL_BLOCK);
        enc.arrived(&headers).unwrap();
        assert_eq!(enc.available().unwrap(), None);

        let data = build_frame(FrameKind::Data, flags::END_STREAM, 1, b"payload");
        enc.arrived(&data).unwrap();
        let unit = enc.available().unwrap().expect("completed stream");

        let mut expected = headers.clone();
        expected.extend_from_slice(&data);
        assert_eq!(&unit[..], &expected[..]);
    }

    #[test]
    fn test_decode_merges_stream_frames() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        enc.arrived(&build_frame(
            FrameKind::Headers,
            flags::END_HEADERS,
            5,
            LITERAL_BLOCK,
        ))
        .unwrap();
        enc.arrived(&build_frame(FrameKind::Data, 0, 5, b"hello ")).unwrap();
        enc.arrived(&build_frame(FrameKind::Data, flags::END_STREAM, 5, b"world"))
            .unwrap();

        let unit = enc.available().unwrap().expect("completed stream");
        let message = enc.decode(&unit).unwrap();
        assert_eq!(message.stream_id, 5);
        assert!(message.end_stream);
        assert_eq!(
            message.headers,
            vec![("custom-key".to_string(), "custom-header".to_string())]
        );
        assert_eq!(&message.body[..], b"hello world");
        assert_eq!(message.framing, Framing::Http2);
    }

    #[test]
    fn test_encode_recomputes_data_frame_lengths() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        drain_prologue(&mut enc);
        enc.arrived(&build_frame(
            FrameKind::Headers,
            flags::END_HEADERS,
            1,
            LITERAL_BLOCK,
        ))
        .unwrap();
        enc.arrived(&build_frame(FrameKind::Data, flags::END_STREAM, 1, b"short"))
            .unwrap();

        let unit = enc.available().unwrap().expect("completed stream");
        let mut message = enc.decode(&unit).unwrap();
        message.body = Bytes::from_static(b"a considerably longer edited body");
        let wire = enc.encode(message).unwrap();

        let frames = parse_frames(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind(), FrameKind::Headers);
        assert_eq!(frames[0].stream_id(), 1);
        assert!(frames[0].is_end_headers());
        assert_eq!(frames[1].kind(), FrameKind::Data);
        assert_eq!(frames[1].payload(), b"a considerably longer edited body");
        assert_eq!(frames[1].payload_len(), 33);
        assert!(frames[1].is_end_stream());
    }

    #[test]
    fn test_encode_splits_body_at_payload_cap() {
        let mut enc = Http2Encoder::builder(Role::ProxyServer)
            .max_data_payload(4)
            .build();
        drain_prologue(&mut enc);

        let message = LogicalMessage {
            stream_id: 3,
            end_stream: true,
            headers: vec![(":status".into(), "200".into())],
            body: Bytes::from_static(b"0123456789"),
            framing: Framing::Http2,
        };
        let wire = enc.encode(message).unwrap();
        let frames = parse_frames(&wire);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1].payload(), b"0123");
        assert_eq!(frames[2].payload(), b"4567");
        assert_eq!(frames[3].payload(), b"89");
        assert!(!frames[2].is_end_stream());
        assert!(frames[3].is_end_stream());
    }

    #[test]
    fn test_encode_empty_body_ends_stream_on_headers() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        drain_prologue(&mut enc);
        let message = LogicalMessage {
            stream_id: 9,
            end_stream: true,
            headers: vec![(":status".into(), "204".into())],
            body: Bytes::new(),
            framing: Framing::Http2,
        };
        let wire = enc.encode(message).unwrap();
        let frames = parse_frames(&wire);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_end_stream());
        assert!(frames[0].is_end_headers());
    }

    #[test]
    fn test_window_gates_encoded_data() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        drain_prologue(&mut enc);

        // Peer shrinks the per-stream send window to 4 bytes.
        let mut settings = Settings::new();
        settings.set(setting_id::INITIAL_WINDOW_SIZE, 4);
        enc.arrived(&settings.to_frame().serialize()).unwrap();
        enc.pass_through().unwrap().expect("settings relay");

        let message = LogicalMessage {
            stream_id: 1,
            end_stream: true,
            headers: vec![(":status".into(), "200".into())],
            body: Bytes::from_static(b"0123456789"),
            framing: Framing::Http2,
        };
        let wire = enc.encode(message).unwrap();
        let frames = parse_frames(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload(), b"0123");
        assert!(!frames[1].is_end_stream());

        // Credit releases the remainder through the pass-through lane.
        enc.arrived(&Frame::window_update(1, 1000).serialize()).unwrap();
        let released = enc.pass_through().unwrap().expect("released data");
        let frames = parse_frames(&released);
        let data: Vec<&Frame> = frames.iter().filter(|f| f.kind() == FrameKind::Data).collect();
        let merged: Vec<u8> = data.iter().flat_map(|f| f.payload().to_vec()).collect();
        assert_eq!(&merged[..], b"456789");
        assert!(data.last().unwrap().is_end_stream());
    }

    #[test]
    fn test_undecodable_unit_round_trips_raw() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        drain_prologue(&mut enc);

        // A HEADERS frame this encoder never parsed: its block cannot be
        // re-decoded, so the unit stays raw and re-encodes verbatim.
        let foreign = build_frame(
            FrameKind::Headers,
            flags::END_HEADERS | flags::END_STREAM,
            7,
            LITERAL_BLOCK,
        );
        let message = enc.decode(&foreign).unwrap();
        assert!(message.is_raw());
        assert_eq!(&message.body[..], &foreign[..]);

        let wire = enc.encode(message).unwrap();
        assert_eq!(&wire[..], &foreign[..]);
    }

    #[test]
    fn test_streams_complete_in_finish_order() {
        let mut enc = Http2Encoder::new(Role::ProxyServer);
        enc.arrived(&build_frame(
            FrameKind::Headers,
            flags::END_HEADERS,
            1,
            LITERAL_BLOCK,
        ))
        .unwrap();
        enc.arrived(&build_frame(
            FrameKind::Headers,
            flags::END_HEADERS | flags::END_STREAM,
            3,
            LITERAL_BLOCK,
        ))
        .unwrap();

        let first = enc.available().unwrap().expect("stream 3 first");
        assert_eq!(enc.decode(&first).unwrap().stream_id, 3);

        enc.arrived(&build_frame(FrameKind::Data, flags::END_STREAM, 1, b"late"))
            .unwrap();
        let second = enc.available().unwrap().expect("stream 1 second");
        let message = enc.decode(&second).unwrap();
        assert_eq!(message.stream_id, 1);
        assert_eq!(&message.body[..], b"late");
    }

    #[test]
    fn test_shared_stream_table_shows_partial_streams() {
        let streams = Arc::new(Mutex::new(StreamManager::new()));
        let mut enc = Http2Encoder::builder(Role::ProxyServer)
            .streams(Arc::clone(&streams))
            .build();
        enc.arrived(&build_frame(FrameKind::Data, 0, 1, b"partial")).unwrap();
        assert_eq!(enc.available().unwrap(), None);

        let table = streams.lock().unwrap();
        assert_eq!(&table.merge_payload(1).unwrap()[..], b"partial");
    }
}
