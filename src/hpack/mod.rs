//! Header compression codec (RFC 7541) with a dynamic table.
//!
//! Each intercepted connection owns two decoder/encoder pairs, one per
//! direction, because the compression context is stateful: a literal with
//! incremental indexing mutates the dynamic table, and every later block
//! may reference that entry by index. Blocks must therefore be decoded
//! exactly once, in the order they crossed the connection. Skipping one,
//! or decoding one twice, silently corrupts every header that follows.
//!
//! Huffman-coded string literals are rejected on decode and never emitted:
//! the encoder always writes H=0, at a modest size cost, which keeps the
//! re-encoded bytes trivially auditable. A peer that sends Huffman strings
//! makes the whole block undecodable, and the caller falls back to
//! relaying the raw frame.

pub mod integer;
pub mod table;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Result, TapwireError};
use table::{DynamicTable, Lookup, DEFAULT_TABLE_SIZE, ENTRY_OVERHEAD};

/// Default cap on the decoded size of one header list, applied when the
/// peer's SETTINGS does not announce one.
pub const DEFAULT_MAX_HEADER_LIST_SIZE: usize = 65536;

/// Stateful header block decoder for one direction of one connection.
///
/// Replaced wholesale when the peer announces new table dimensions in
/// SETTINGS, which resets the dynamic table to empty.
pub struct HpackDecoder {
    table: DynamicTable,
    /// Upper bound a dynamic table size update may set (RFC 7541 §6.3).
    max_table_size: usize,
    max_header_list_size: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_TABLE_SIZE, DEFAULT_MAX_HEADER_LIST_SIZE)
    }

    /// Build a decoder sized from the peer's announced limits.
    pub fn with_limits(max_table_size: usize, max_header_list_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            max_table_size,
            max_header_list_size,
        }
    }

    /// Decode one complete header block.
    ///
    /// Mutates the dynamic table, so blocks from one direction must pass
    /// through here exactly once, in wire order.
    ///
    /// # Errors
    ///
    /// Fails on references to unknown indices, Huffman-coded strings,
    /// truncated input, oversized size updates, and header lists beyond
    /// the configured cap. The table may be partially updated at that
    /// point; callers are expected to stop interpreting this direction
    /// and relay raw bytes instead.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        let mut list_size = 0usize;
        let mut pos = 0;

        while pos < block.len() {
            let first = block[pos];

            if first & 0b1000_0000 != 0 {
                // §6.1 Indexed Header Field: 1xxxxxxx
                let (index, consumed) = integer::decode_integer(&block[pos..], 7)?;
                pos += consumed;
                let (name, value) = table::resolve(&self.table, index)
                    .map(|(n, v)| (n.to_vec(), v.to_vec()))
                    .ok_or_else(|| {
                        TapwireError::Hpack(format!("indexed field references index {index}"))
                    })?;
                self.account(&mut list_size, &name, &value)?;
                headers.push((into_text(name), into_text(value)));
            } else if first & 0b1100_0000 == 0b0100_0000 {
                // §6.2.1 Literal with Incremental Indexing: 01xxxxxx
                let (name_index, consumed) = integer::decode_integer(&block[pos..], 6)?;
                pos += consumed;
                let (name, value, used) = self.read_literal(&block[pos..], name_index)?;
                pos += used;
                self.table.insert(&name, &value);
                self.account(&mut list_size, &name, &value)?;
                headers.push((into_text(name), into_text(value)));
            } else if first & 0b1110_0000 == 0b0010_0000 {
                // §6.3 Dynamic Table Size Update: 001xxxxx
                let (new_size, consumed) = integer::decode_integer(&block[pos..], 5)?;
                pos += consumed;
                let new_size = new_size as usize;
                if new_size > self.max_table_size {
                    return Err(TapwireError::Hpack(format!(
                        "size update to {new_size} exceeds announced limit {}",
                        self.max_table_size
                    )));
                }
                trace!(new_size, "dynamic table size update");
                self.table.set_max_size(new_size);
            } else if first & 0b1111_0000 == 0b0000_0000 || first & 0b1111_0000 == 0b0001_0000 {
                // §6.2.2 / §6.2.3 Literal without Indexing and Never
                // Indexed: 0000xxxx / 0001xxxx. Neither touches the table.
                let (name_index, consumed) = integer::decode_integer(&block[pos..], 4)?;
                pos += consumed;
                let (name, value, used) = self.read_literal(&block[pos..], name_index)?;
                pos += used;
                self.account(&mut list_size, &name, &value)?;
                headers.push((into_text(name), into_text(value)));
            } else {
                return Err(TapwireError::Hpack(format!(
                    "unrecognised field prefix {first:#04x}"
                )));
            }
        }

        Ok(headers)
    }

    /// Read a literal field body: name by index or literal, then the value.
    /// Returns owned bytes and the input consumed.
    fn read_literal(&self, src: &[u8], name_index: u64) -> Result<(Vec<u8>, Vec<u8>, usize)> {
        let mut pos = 0;

        let name = if name_index > 0 {
            table::resolve(&self.table, name_index)
                .map(|(n, _)| n.to_vec())
                .ok_or_else(|| {
                    TapwireError::Hpack(format!("literal name references index {name_index}"))
                })?
        } else {
            let (name, consumed) = decode_string(&src[pos..])?;
            pos += consumed;
            name
        };

        let (value, consumed) = decode_string(&src[pos..])?;
        pos += consumed;

        Ok((name, value, pos))
    }

    fn account(&self, list_size: &mut usize, name: &[u8], value: &[u8]) -> Result<()> {
        *list_size += name.len() + value.len() + ENTRY_OVERHEAD;
        if *list_size > self.max_header_list_size {
            return Err(TapwireError::Hpack(format!(
                "header list exceeds {} octets",
                self.max_header_list_size
            )));
        }
        Ok(())
    }

    /// Current number of dynamic entries.
    pub fn dynamic_table_len(&self) -> usize {
        self.table.len()
    }

    /// Occupied dynamic table octets.
    pub fn dynamic_table_size(&self) -> usize {
        self.table.size()
    }
}

/// Decode a string literal: H bit, length with a 7-bit prefix, raw bytes.
///
/// Huffman-coded strings (H=1) are rejected here.
fn decode_string(src: &[u8]) -> Result<(Vec<u8>, usize)> {
    if src.is_empty() {
        return Err(TapwireError::Hpack("string literal truncated".into()));
    }
    let huffman = src[0] & 0x80 != 0;
    if huffman {
        return Err(TapwireError::Hpack(
            "huffman-coded string literal not supported".into(),
        ));
    }
    let (length, consumed) = integer::decode_integer(src, 7)?;
    let length = length as usize;
    if src.len() - consumed < length {
        return Err(TapwireError::Hpack(format!(
            "string literal declares {length} bytes, {} available",
            src.len() - consumed
        )));
    }
    let data = src[consumed..consumed + length].to_vec();
    Ok((data, consumed + length))
}

/// Stateful header block encoder for one direction of one connection.
///
/// Mirrors the decoder's ordering contract: blocks it produces reference
/// entries inserted by earlier blocks, so they must be sent in the order
/// they were encoded.
pub struct HpackEncoder {
    table: DynamicTable,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self::with_table_size(DEFAULT_TABLE_SIZE)
    }

    pub fn with_table_size(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
        }
    }

    /// Encode a header list into one block.
    ///
    /// Fields matching an indexed entry are emitted as a single index.
    /// Everything else becomes a literal with incremental indexing, H=0,
    /// unless the entry would not even fit the table alone, in which case
    /// it is sent without indexing to avoid flushing the table for
    /// nothing.
    pub fn encode(&mut self, headers: &[(String, String)]) -> Bytes {
        let mut buf = BytesMut::new();

        for (name, value) in headers {
            let name = name.as_bytes();
            let value = value.as_bytes();

            match table::find(&self.table, name, value) {
                Lookup::Full(index) => {
                    integer::encode_integer(index, 7, 0b1000_0000, &mut buf);
                }
                Lookup::Name(index) => {
                    if self.fits_table(name, value) {
                        integer::encode_integer(index, 6, 0b0100_0000, &mut buf);
                        encode_string(value, &mut buf);
                        self.table.insert(name, value);
                    } else {
                        integer::encode_integer(index, 4, 0b0000_0000, &mut buf);
                        encode_string(value, &mut buf);
                    }
                }
                Lookup::Miss => {
                    if self.fits_table(name, value) {
                        buf.put_u8(0b0100_0000);
                        encode_string(name, &mut buf);
                        encode_string(value, &mut buf);
                        self.table.insert(name, value);
                    } else {
                        buf.put_u8(0b0000_0000);
                        encode_string(name, &mut buf);
                        encode_string(value, &mut buf);
                    }
                }
            }
        }

        buf.freeze()
    }

    fn fits_table(&self, name: &[u8], value: &[u8]) -> bool {
        name.len() + value.len() + ENTRY_OVERHEAD <= self.table.max_size()
    }
}

/// Encode a string literal: H=0, length with a 7-bit prefix, raw bytes.
fn encode_string(s: &[u8], buf: &mut BytesMut) {
    integer::encode_integer(s.len() as u64, 7, 0x00, buf);
    buf.put_slice(s);
}

fn into_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(headers: &[(&str, &str)]) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    // RFC 7541 Appendix C.3: three request blocks over one connection,
    // without Huffman coding.
    fn c3_first_request() -> Vec<u8> {
        let mut block = vec![0x82, 0x86, 0x84, 0x41, 0x0f];
        block.extend_from_slice(b"www.example.com");
        block
    }

    fn c3_second_request() -> Vec<u8> {
        let mut block = vec![0x82, 0x86, 0x84, 0xbe, 0x58, 0x08];
        block.extend_from_slice(b"no-cache");
        block
    }

    fn c3_third_request() -> Vec<u8> {
        let mut block = vec![0x82, 0x87, 0x85, 0xbf, 0x40, 0x0a];
        block.extend_from_slice(b"custom-key");
        block.push(0x0c);
        block.extend_from_slice(b"custom-value");
        block
    }

    #[test]
    fn rfc7541_c2_1_literal_with_indexing() {
        let mut block = vec![0x40, 0x0a];
        block.extend_from_slice(b"custom-key");
        block.push(0x0d);
        block.extend_from_slice(b"custom-header");

        let mut decoder = HpackDecoder::new();
        let headers = decoder.decode(&block).unwrap();

        assert_eq!(headers, pairs(&[("custom-key", "custom-header")]));
        assert_eq!(decoder.dynamic_table_len(), 1);
        assert_eq!(decoder.dynamic_table_size(), 55);
    }

    #[test]
    fn rfc7541_c2_2_literal_without_indexing() {
        let mut block = vec![0x04, 0x0c];
        block.extend_from_slice(b"/sample/path");

        let mut decoder = HpackDecoder::new();
        let headers = decoder.decode(&block).unwrap();

        assert_eq!(headers, pairs(&[(":path", "/sample/path")]));
        assert_eq!(decoder.dynamic_table_len(), 0);
    }

    #[test]
    fn rfc7541_c2_3_literal_never_indexed() {
        let mut block = vec![0x10, 0x08];
        block.extend_from_slice(b"password");
        block.push(0x06);
        block.extend_from_slice(b"secret");

        let mut decoder = HpackDecoder::new();
        let headers = decoder.decode(&block).unwrap();

        assert_eq!(headers, pairs(&[("password", "secret")]));
        assert_eq!(decoder.dynamic_table_len(), 0);
    }

    #[test]
    fn rfc7541_c2_4_indexed_field() {
        let mut decoder = HpackDecoder::new();
        let headers = decoder.decode(&[0x82]).unwrap();
        assert_eq!(headers, pairs(&[(":method", "GET")]));
    }

    #[test]
    fn rfc7541_c3_requests_share_one_context() {
        let mut decoder = HpackDecoder::new();

        let first = decoder.decode(&c3_first_request()).unwrap();
        assert_eq!(
            first,
            pairs(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ])
        );
        assert_eq!(decoder.dynamic_table_size(), 57);

        // 0xbe resolves :authority through the entry the first block added.
        let second = decoder.decode(&c3_second_request()).unwrap();
        assert_eq!(
            second,
            pairs(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
                ("cache-control", "no-cache"),
            ])
        );
        assert_eq!(decoder.dynamic_table_size(), 110);

        let third = decoder.decode(&c3_third_request()).unwrap();
        assert_eq!(
            third,
            pairs(&[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/index.html"),
                (":authority", "www.example.com"),
                ("custom-key", "custom-value"),
            ])
        );
        assert_eq!(decoder.dynamic_table_size(), 164);
    }

    /// Decoding blocks out of order desynchronizes the context: the second
    /// block indexes an entry only the first block inserts.
    #[test]
    fn skipping_a_block_breaks_later_references() {
        let mut fresh = HpackDecoder::new();
        let err = fresh.decode(&c3_second_request()).unwrap_err();
        assert!(err.to_string().contains("index"));
    }

    #[test]
    fn size_update_instruction_shrinks_table() {
        let mut decoder = HpackDecoder::new();
        decoder.decode(&c3_first_request()).unwrap();
        assert_eq!(decoder.dynamic_table_len(), 1);

        // 0x20 is a size update to zero, which evicts everything.
        decoder.decode(&[0x20]).unwrap();
        assert_eq!(decoder.dynamic_table_len(), 0);

        let err = decoder.decode(&c3_second_request()).unwrap_err();
        assert!(err.to_string().contains("index"));
    }

    #[test]
    fn size_update_above_announced_limit_fails() {
        let mut decoder = HpackDecoder::with_limits(256, DEFAULT_MAX_HEADER_LIST_SIZE);
        let mut block = BytesMut::new();
        integer::encode_integer(512, 5, 0b0010_0000, &mut block);
        let err = decoder.decode(&block).unwrap_err();
        assert!(err.to_string().contains("exceeds announced limit"));
    }

    #[test]
    fn huffman_strings_are_rejected() {
        // RFC 7541 C.4.1: the same first request with Huffman-coded
        // authority. The H bit on the string length makes it undecodable
        // here.
        let block: &[u8] = &[
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let mut decoder = HpackDecoder::new();
        let err = decoder.decode(block).unwrap_err();
        assert!(err.to_string().contains("huffman"));
    }

    #[test]
    fn header_list_cap_is_enforced() {
        let mut decoder = HpackDecoder::with_limits(4096, 64);
        let mut block = vec![0x40, 0x0a];
        block.extend_from_slice(b"custom-key");
        block.push(0x28);
        block.extend_from_slice(&[b'v'; 40]);

        let err = decoder.decode(&block).unwrap_err();
        assert!(err.to_string().contains("header list exceeds"));
    }

    #[test]
    fn encoder_emits_c2_1_bytes_for_fresh_custom_header() {
        let mut encoder = HpackEncoder::new();
        let block = encoder.encode(&pairs(&[("custom-key", "custom-header")]));

        let mut expected = vec![0x40, 0x0a];
        expected.extend_from_slice(b"custom-key");
        expected.push(0x0d);
        expected.extend_from_slice(b"custom-header");
        assert_eq!(&block[..], &expected[..]);
    }

    #[test]
    fn encoder_uses_static_index_for_known_pairs() {
        let mut encoder = HpackEncoder::new();
        let block = encoder.encode(&pairs(&[(":method", "GET"), (":status", "200")]));
        assert_eq!(&block[..], &[0x82, 0x88]);
    }

    #[test]
    fn encoder_reuses_dynamic_entries_on_repeat() {
        let mut encoder = HpackEncoder::new();
        let headers = pairs(&[("x-request-id", "abc123")]);

        let first = encoder.encode(&headers);
        let second = encoder.encode(&headers);

        // Second block is a single indexed reference to entry 62.
        assert!(first.len() > second.len());
        assert_eq!(&second[..], &[0x80 | 62]);
    }

    #[test]
    fn encoder_and_decoder_evolve_together() {
        let mut encoder = HpackEncoder::new();
        let mut decoder = HpackDecoder::new();

        let first = pairs(&[
            (":method", "POST"),
            (":path", "/submit"),
            ("x-session", "0xdeadbeef"),
        ]);
        let second = pairs(&[
            (":method", "POST"),
            (":path", "/submit"),
            ("x-session", "0xdeadbeef"),
            ("content-type", "application/json"),
        ]);

        let block1 = encoder.encode(&first);
        let block2 = encoder.encode(&second);

        assert_eq!(decoder.decode(&block1).unwrap(), first);
        assert_eq!(decoder.decode(&block2).unwrap(), second);

        // The same second block against a fresh decoder references entries
        // it never saw inserted.
        let mut fresh = HpackDecoder::new();
        assert!(fresh.decode(&block2).is_err());
    }

    #[test]
    fn encoder_with_zero_table_never_indexes() {
        let mut encoder = HpackEncoder::with_table_size(0);
        let mut decoder = HpackDecoder::with_limits(0, DEFAULT_MAX_HEADER_LIST_SIZE);

        let headers = pairs(&[("x-trace", "on"), ("x-trace", "on")]);
        let block1 = encoder.encode(&headers);
        let block2 = encoder.encode(&headers);

        // Without table space the blocks cannot shrink, and both must
        // decode on a decoder that equally holds nothing.
        assert_eq!(block1, block2);
        assert_eq!(decoder.decode(&block1).unwrap(), headers);
        assert_eq!(decoder.dynamic_table_len(), 0);
    }

    #[test]
    fn non_utf8_values_survive_lossily() {
        let mut block = vec![0x00, 0x03];
        block.extend_from_slice(b"bin");
        block.push(0x02);
        block.extend_from_slice(&[0xff, 0xfe]);

        let mut decoder = HpackDecoder::new();
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "bin");
        assert_eq!(headers[0].1.chars().count(), 2);
    }
}
