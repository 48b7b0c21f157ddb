//! WebSocket encoder.
//!
//! Speaks HTTP/1.1 until the upgrade handshake completes, then switches
//! to frame mode. The switch happens when the `101 Switching Protocols`
//! response is re-encoded, never earlier, so the handshake response
//! itself still travels as HTTP. The two directions of a connection
//! share the upgrade flag through [`WebSocketEncoder::pair`]; the
//! direction carrying the client's first frame has no 101 of its own to
//! observe.
//!
//! In frame mode a unit is one whole message: every fragment through the
//! first frame with FIN set. Decode unmasks and joins the fragments;
//! encode emits one unfragmented frame, reusing the original mask key so
//! an unedited message round-trips byte-identically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoder::{http1, Encoder, Framing, LogicalMessage, RecvBuffer, ResendPolicy, Role};
use crate::error::{Result, TapwireError};

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xa;

/// Mask key for messages composed by the proxy itself.
const RESEND_MASK: [u8; 4] = [0xaa, 0xaa, 0xaa, 0xaa];

/// One parsed frame.
struct WsFrame {
    fin: bool,
    opcode: u8,
    mask_key: Option<[u8; 4]>,
    /// Payload with the mask already removed.
    payload: Bytes,
    /// Wire bytes this frame occupied.
    consumed: usize,
}

/// Upgrade-aware message encoder for WebSocket endpoints.
pub struct WebSocketEncoder {
    role: Role,
    recv: RecvBuffer,
    upgraded: Arc<AtomicBool>,
}

impl WebSocketEncoder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            recv: RecvBuffer::new(),
            upgraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Encoders for both directions of one connection, sharing the
    /// upgrade flag. The first element faces the origin server, the
    /// second faces the client application.
    pub fn pair() -> (Self, Self) {
        let upgraded = Arc::new(AtomicBool::new(false));
        let client_side = Self {
            role: Role::ProxyClient,
            recv: RecvBuffer::new(),
            upgraded: Arc::clone(&upgraded),
        };
        let server_side = Self {
            role: Role::ProxyServer,
            recv: RecvBuffer::new(),
            upgraded,
        };
        (client_side, server_side)
    }

    /// Force frame mode, for connections whose handshake happened
    /// elsewhere.
    pub fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::Release);
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }
}

impl Encoder for WebSocketEncoder {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn check_delimiter(&self, buf: &[u8]) -> Result<Option<usize>> {
        if self.is_upgraded() {
            Ok(ws_delimiter(buf))
        } else {
            Ok(http1::http_delimiter(buf))
        }
    }

    fn arrived(&mut self, data: &[u8]) -> Result<()> {
        self.recv.push(data);
        Ok(())
    }

    fn available(&mut self) -> Result<Option<Bytes>> {
        let delimited = if self.is_upgraded() {
            ws_delimiter(self.recv.view())
        } else {
            http1::http_delimiter(self.recv.view())
        };
        match delimited {
            Some(len) => Ok(Some(self.recv.take(len))),
            None => Ok(None),
        }
    }

    fn decode(&mut self, data: &[u8]) -> Result<LogicalMessage> {
        if self.is_upgraded() {
            Ok(decode_ws(data))
        } else {
            Ok(http1::decode_http(data))
        }
    }

    fn encode(&mut self, message: LogicalMessage) -> Result<Bytes> {
        match &message.framing {
            Framing::WebSocket { opcode, mask_key } => {
                let mask = mask_key.or(match self.role {
                    // Client-to-server traffic must be masked.
                    Role::ProxyClient | Role::ResendClient => Some(RESEND_MASK),
                    Role::ProxyServer => None,
                });
                Ok(build_ws_frame(true, *opcode, mask, &message.body))
            }
            Framing::Http1 { start_line, .. } => {
                let switching = http1::status_code(start_line) == Some(101);
                let wire = http1::encode_http(&message)?;
                if switching {
                    self.upgraded.store(true, Ordering::Release);
                }
                Ok(wire)
            }
            Framing::Raw => Ok(message.body.clone()),
            other => Err(TapwireError::Encode(format!(
                "message framed as {other:?} cannot be serialized as websocket"
            ))),
        }
    }

    /// Frames ride the live upgraded connection; a handshake on a fresh
    /// one would replay the whole upgrade.
    fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy::reuse_live()
    }
}

/// Length of the first complete message, every fragment through FIN, or
/// `None` while more bytes are needed.
fn ws_delimiter(data: &[u8]) -> Option<usize> {
    let mut pos = 0usize;
    loop {
        let frame = parse_ws_frame(&data[pos..])?;
        pos += frame.consumed;
        if frame.fin {
            return Some(pos);
        }
    }
}

/// Parse and unmask one frame, or `None` while incomplete.
fn parse_ws_frame(data: &[u8]) -> Option<WsFrame> {
    if data.len() < 2 {
        return None;
    }
    let fin = data[0] & 0x80 != 0;
    let opcode = data[0] & 0x0f;
    let masked = data[1] & 0x80 != 0;
    let short_len = (data[1] & 0x7f) as usize;

    let (payload_len, mut pos) = match short_len {
        126 => {
            if data.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([data[2], data[3]]) as usize, 4)
        }
        127 => {
            if data.len() < 10 {
                return None;
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&data[2..10]);
            (usize::try_from(u64::from_be_bytes(len)).ok()?, 10)
        }
        n => (n, 2),
    };

    let mask_key = if masked {
        if data.len() < pos + 4 {
            return None;
        }
        let key = [data[pos], data[pos + 1], data[pos + 2], data[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };

    if data.len() < pos + payload_len {
        return None;
    }
    let payload = match mask_key {
        Some(key) => data[pos..pos + payload_len]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect(),
        None => Bytes::copy_from_slice(&data[pos..pos + payload_len]),
    };
    Some(WsFrame {
        fin,
        opcode,
        mask_key,
        payload,
        consumed: pos + payload_len,
    })
}

/// Interpret one complete message: fragments joined, mask removed.
///
/// Total: bytes that fail the frame grammar come back as a raw unit.
fn decode_ws(data: &[u8]) -> LogicalMessage {
    let mut pos = 0usize;
    let mut body = BytesMut::new();
    let mut first: Option<(u8, Option<[u8; 4]>)> = None;
    loop {
        let Some(frame) = parse_ws_frame(&data[pos..]) else {
            return LogicalMessage::raw(Bytes::copy_from_slice(data));
        };
        pos += frame.consumed;
        if first.is_none() {
            first = Some((frame.opcode, frame.mask_key));
        }
        body.extend_from_slice(&frame.payload);
        if frame.fin {
            break;
        }
    }
    let (opcode, mask_key) = first.unwrap_or((OPCODE_BINARY, None));
    LogicalMessage {
        stream_id: 0,
        end_stream: true,
        headers: Vec::new(),
        body: body.freeze(),
        framing: Framing::WebSocket { opcode, mask_key },
    }
}

/// Serialize one frame, masking the payload when a key is given.
fn build_ws_frame(fin: bool, opcode: u8, mask_key: Option<[u8; 4]>, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 14);
    out.put_u8(if fin { 0x80 } else { 0 } | (opcode & 0x0f));
    let mask_bit = if mask_key.is_some() { 0x80 } else { 0 };
    if payload.len() < 126 {
        out.put_u8(mask_bit | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.put_u8(mask_bit | 126);
        out.put_u16(payload.len() as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(payload.len() as u64);
    }
    match mask_key {
        Some(key) => {
            out.put_slice(&key);
            for (i, b) in payload.iter().enumerate() {
                out.put_u8(b ^ key[i % 4]);
            }
        }
        None => out.put_slice(payload),
    }
    out.freeze()
}
