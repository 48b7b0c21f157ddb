//! HTTP/1.1 encoder.
//!
//! Units are whole request or response messages. The delimiter walks the
//! header block for the body length rule that applies (status 100, chunked
//! transfer coding, `Content-Length`, or read-to-date), `decode` strips the
//! transfer coding, and `encode` re-emits the message with a recomputed
//! `Content-Length` so edited bodies stay consistent on the wire.
//!
//! The parsing helpers are shared with the WebSocket encoder, which speaks
//! HTTP/1.1 until the upgrade handshake completes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoder::{Encoder, Framing, LogicalMessage, RecvBuffer};
use crate::error::{Result, TapwireError};

/// Request/response message encoder for HTTP/1.1 endpoints.
#[derive(Debug, Default)]
pub struct Http1Encoder {
    recv: RecvBuffer,
}

impl Http1Encoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for Http1Encoder {
    fn name(&self) -> &'static str {
        "http/1.1"
    }

    fn check_delimiter(&self, buf: &[u8]) -> Result<Option<usize>> {
        Ok(http_delimiter(buf))
    }

    fn arrived(&mut self, data: &[u8]) -> Result<()> {
        self.recv.push(data);
        Ok(())
    }

    fn available(&mut self) -> Result<Option<Bytes>> {
        match http_delimiter(self.recv.view()) {
            Some(len) => Ok(Some(self.recv.take(len))),
            None => Ok(None),
        }
    }

    fn decode(&mut self, data: &[u8]) -> Result<LogicalMessage> {
        Ok(decode_http(data))
    }

    fn encode(&mut self, message: LogicalMessage) -> Result<Bytes> {
        encode_http(&message)
    }
}

/// Offset one past the header block (the empty line included), or `None`
/// while the block is still incomplete.
///
/// A `\r\n\r\n` terminator anywhere in the buffer wins over a bare `\n\n`.
pub(crate) fn find_header_end(data: &[u8]) -> Option<usize> {
    if let Some(i) = find(data, b"\r\n\r\n") {
        return Some(i + 4);
    }
    find(data, b"\n\n").map(|i| i + 2)
}

/// Length of the first complete HTTP/1.1 message, or `None` while more
/// bytes are needed.
pub(crate) fn http_delimiter(data: &[u8]) -> Option<usize> {
    let header_end = find_header_end(data)?;
    let head = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = head.lines();
    let start_line = lines.next().unwrap_or_default();

    // Interim responses are header-only whatever fields they carry.
    if status_code(start_line).is_some_and(|code| (100..200).contains(&code)) {
        return Some(header_end);
    }

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                chunked = true;
            } else if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().ok();
            }
        }
    }

    if chunked {
        let (consumed, _) = parse_chunked(&data[header_end..])?;
        return Some(header_end + consumed);
    }
    if let Some(len) = content_length {
        if data.len() >= header_end + len {
            return Some(header_end + len);
        }
        return None;
    }
    // No framing header: the unit is everything received so far.
    Some(data.len())
}

/// Interpret one complete message.
///
/// Total: anything that fails the HTTP grammar comes back as a raw unit
/// instead of an error, so undecodable traffic still flows.
pub(crate) fn decode_http(data: &[u8]) -> LogicalMessage {
    match try_decode_http(data) {
        Some(message) => message,
        None => LogicalMessage::raw(Bytes::copy_from_slice(data)),
    }
}

fn try_decode_http(data: &[u8]) -> Option<LogicalMessage> {
    let header_end = find_header_end(data)?;
    let head = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = head.lines();
    let start_line = lines.next()?.to_string();
    if !valid_start_line(&start_line) {
        return None;
    }

    let mut headers = Vec::new();
    let mut chunked = false;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        // Body framing headers are re-derived on encode; carrying them
        // through an edit would let them go stale.
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        headers.push((name, value));
    }

    let raw_body = &data[header_end..];
    let body = if chunked {
        let (_, body) = parse_chunked(raw_body)?;
        body.freeze()
    } else {
        Bytes::copy_from_slice(raw_body)
    };

    Some(LogicalMessage {
        stream_id: 0,
        end_stream: true,
        headers,
        body,
        framing: Framing::Http1 {
            start_line,
            chunked,
        },
    })
}

/// Serialize a message back to the wire with a recomputed
/// `Content-Length`. Chunked bodies come out as plain bodies.
pub(crate) fn encode_http(message: &LogicalMessage) -> Result<Bytes> {
    let start_line = match &message.framing {
        Framing::Http1 { start_line, .. } => start_line.as_str(),
        Framing::Raw => return Ok(message.body.clone()),
        other => {
            return Err(TapwireError::Encode(format!(
                "message framed as {other:?} cannot be serialized as http/1.1"
            )))
        }
    };

    let mut out = BytesMut::with_capacity(message.body.len() + 256);
    out.put_slice(start_line.as_bytes());
    out.put_slice(b"\r\n");
    for (name, value) in &message.headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    let bodyless_status = status_code(start_line)
        .is_some_and(|code| (100..200).contains(&code) || code == 204);
    if bodyless_status && message.body.is_empty() {
        out.put_slice(b"\r\n");
        return Ok(out.freeze());
    }
    out.put_slice(format!("Content-Length: {}\r\n", message.body.len()).as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(&message.body);
    Ok(out.freeze())
}

/// `METHOD target HTTP/x` or `HTTP/x code reason`.
fn valid_start_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(first) = parts.next() else {
        return false;
    };
    if first.starts_with("HTTP/") {
        return parts
            .next()
            .is_some_and(|code| !code.is_empty() && code.chars().all(|c| c.is_ascii_digit()));
    }
    let target = parts.next();
    let version = parts.next();
    target.is_some() && version.is_some_and(|v| v.starts_with("HTTP/"))
}

/// Status code of a response start line, `None` for requests.
pub(crate) fn status_code(start_line: &str) -> Option<u16> {
    if !start_line.starts_with("HTTP/") {
        return None;
    }
    start_line.split_whitespace().nth(1)?.parse().ok()
}

/// Walk a chunked body. Returns the bytes consumed through the final
/// zero chunk and the de-chunked payload, or `None` while incomplete.
fn parse_chunked(data: &[u8]) -> Option<(usize, BytesMut)> {
    let mut body = BytesMut::new();
    let mut pos = 0usize;
    loop {
        let line_end = find(&data[pos..], b"\r\n")? + pos;
        let size_text = std::str::from_utf8(&data[pos..line_end]).ok()?;
        let size_text = size_text.split(';').next()?.trim();
        let size = usize::from_str_radix(size_text, 16).ok()?;
        pos = line_end + 2;
        if size == 0 {
            // Trailer section, if any, runs through its own blank line.
            // Trailer fields are dropped with the rest of the coding.
            loop {
                let line_end = find(&data[pos..], b"\r\n")? + pos;
                let line_empty = line_end == pos;
                pos = line_end + 2;
                if line_empty {
                    return Some((pos, body));
                }
            }
        }
        if data.len() < pos + size + 2 {
            return None;
        }
        body.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
