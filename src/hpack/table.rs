//! Static and dynamic indexing tables (RFC 7541 Sections 2.3 and 4).
//!
//! The static table holds 61 predefined entries, indexed 1 through 61 on
//! the wire. Dynamic entries follow in the same address space starting at
//! 62, newest first. Index 0 is never valid.
//!
//! The dynamic table is the shared state that makes header decoding
//! order-sensitive: every literal with incremental indexing shifts the
//! addresses of all existing dynamic entries by one.

use std::collections::VecDeque;

/// Bytes charged to an entry beyond its name and value (RFC 7541 §4.1).
pub const ENTRY_OVERHEAD: usize = 32;

/// Number of entries in the static table.
pub const STATIC_TABLE_LEN: usize = 61;

/// Default dynamic table capacity before any SETTINGS or size update.
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// The static table (61 entries, 1-indexed on wire, stored 0-indexed).
static STATIC_TABLE: [(&[u8], &[u8]); STATIC_TABLE_LEN] = [
    (b":authority", b""),                  //  1
    (b":method", b"GET"),                  //  2
    (b":method", b"POST"),                 //  3
    (b":path", b"/"),                      //  4
    (b":path", b"/index.html"),            //  5
    (b":scheme", b"http"),                 //  6
    (b":scheme", b"https"),                //  7
    (b":status", b"200"),                  //  8
    (b":status", b"204"),                  //  9
    (b":status", b"206"),                  // 10
    (b":status", b"304"),                  // 11
    (b":status", b"400"),                  // 12
    (b":status", b"404"),                  // 13
    (b":status", b"500"),                  // 14
    (b"accept-charset", b""),              // 15
    (b"accept-encoding", b"gzip, deflate"), // 16
    (b"accept-language", b""),             // 17
    (b"accept-ranges", b""),               // 18
    (b"accept", b""),                      // 19
    (b"access-control-allow-origin", b""), // 20
    (b"age", b""),                         // 21
    (b"allow", b""),                       // 22
    (b"authorization", b""),               // 23
    (b"cache-control", b""),               // 24
    (b"content-disposition", b""),         // 25
    (b"content-encoding", b""),            // 26
    (b"content-language", b""),            // 27
    (b"content-length", b""),              // 28
    (b"content-location", b""),            // 29
    (b"content-range", b""),               // 30
    (b"content-type", b""),                // 31
    (b"cookie", b""),                      // 32
    (b"date", b""),                        // 33
    (b"etag", b""),                        // 34
    (b"expect", b""),                      // 35
    (b"expires", b""),                     // 36
    (b"from", b""),                        // 37
    (b"host", b""),                        // 38
    (b"if-match", b""),                    // 39
    (b"if-modified-since", b""),           // 40
    (b"if-none-match", b""),               // 41
    (b"if-range", b""),                    // 42
    (b"if-unmodified-since", b""),         // 43
    (b"last-modified", b""),               // 44
    (b"link", b""),                        // 45
    (b"location", b""),                    // 46
    (b"max-forwards", b""),                // 47
    (b"proxy-authenticate", b""),          // 48
    (b"proxy-authorization", b""),         // 49
    (b"range", b""),                       // 50
    (b"referer", b""),                     // 51
    (b"refresh", b""),                     // 52
    (b"retry-after", b""),                 // 53
    (b"server", b""),                      // 54
    (b"set-cookie", b""),                  // 55
    (b"strict-transport-security", b""),   // 56
    (b"transfer-encoding", b""),           // 57
    (b"user-agent", b""),                  // 58
    (b"vary", b""),                        // 59
    (b"via", b""),                         // 60
    (b"www-authenticate", b""),            // 61
];

/// Size charged to one entry.
fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// The dynamic half of the index address space.
///
/// Entries are stored newest first: relative index 0 is the most recently
/// inserted entry, which the wire addresses as 62.
#[derive(Debug, Clone)]
pub struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Insert an entry at the front, evicting from the back until the table
    /// fits its limit. An entry larger than the whole limit empties the
    /// table and is not stored (RFC 7541 §4.4).
    pub fn insert(&mut self, name: &[u8], value: &[u8]) {
        let added = entry_size(name, value);
        if added > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        while self.size + added > self.max_size {
            self.evict_one();
        }
        self.entries.push_front((name.to_vec(), value.to_vec()));
        self.size += added;
    }

    /// Change the capacity, evicting oldest entries as needed.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > self.max_size {
            self.evict_one();
        }
    }

    fn evict_one(&mut self) {
        if let Some((name, value)) = self.entries.pop_back() {
            self.size -= entry_size(&name, &value);
        }
    }

    /// Entry at relative index, 0 being the newest.
    pub fn get(&self, rel: usize) -> Option<(&[u8], &[u8])> {
        self.entries
            .get(rel)
            .map(|(name, value)| (name.as_slice(), value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Occupied size in table octets, counting per-entry overhead.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

/// Result of searching both tables for a header to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Name and value both match. Wire index.
    Full(u64),
    /// Only the name matches. Wire index.
    Name(u64),
    /// Nothing matches.
    Miss,
}

/// Resolve a wire index against the combined address space.
pub fn resolve(dynamic: &DynamicTable, index: u64) -> Option<(&[u8], &[u8])> {
    if index == 0 {
        return None;
    }
    let index = index as usize;
    if index <= STATIC_TABLE_LEN {
        let (name, value) = STATIC_TABLE[index - 1];
        return Some((name, value));
    }
    dynamic.get(index - STATIC_TABLE_LEN - 1)
}

/// Search both tables for a header field, static entries first so repeated
/// encodes stay stable regardless of dynamic churn.
pub fn find(dynamic: &DynamicTable, name: &[u8], value: &[u8]) -> Lookup {
    let mut name_match: Option<u64> = None;

    for (i, (entry_name, entry_value)) in STATIC_TABLE.iter().enumerate() {
        if *entry_name == name {
            if *entry_value == value {
                return Lookup::Full((i + 1) as u64);
            }
            if name_match.is_none() {
                name_match = Some((i + 1) as u64);
            }
        }
    }

    for rel in 0..dynamic.len() {
        let (entry_name, entry_value) = dynamic.get(rel).expect("index within len");
        if entry_name == name {
            let index = (STATIC_TABLE_LEN + 1 + rel) as u64;
            if entry_value == value {
                return Lookup::Full(index);
            }
            if name_match.is_none() {
                name_match = Some(index);
            }
        }
    }

    match name_match {
        Some(index) => Lookup::Name(index),
        None => Lookup::Miss,
    }
}
