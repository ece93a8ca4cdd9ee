//! Wire codec for directory change records.
//!
//! A completion hands the worker a byte buffer holding a batch of
//! variable-length records, each laid out as:
//!
//! ```text
//! [next_entry_offset: u32][action: u32][name_len: u32][name: UTF-16LE][pad]
//! ```
//!
//! All integers are little-endian. `name_len` counts bytes, not code units.
//! Records are padded to 4-byte alignment and chained through
//! `next_entry_offset`; a zero offset terminates the batch (or the buffer
//! runs out). Decoding is tolerant: a truncated or malformed record ends the
//! batch rather than failing it.

/// Fixed per-watch read buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Raw action codes carried in change records. Single-bit flags, so the
/// priority-ordered mapping to a semantic action is unambiguous.
pub const ACTION_ADDED: u32 = 0x0000_0001;
pub const ACTION_REMOVED: u32 = 0x0000_0002;
pub const ACTION_MODIFIED: u32 = 0x0000_0004;
pub const ACTION_RENAMED_OLD_NAME: u32 = 0x0000_0008;
pub const ACTION_RENAMED_NEW_NAME: u32 = 0x0000_0010;

/// Change classes a watch subscribes to.
pub const FILTER_FILE_NAME: u32 = 0x0000_0001;
pub const FILTER_DIR_NAME: u32 = 0x0000_0002;
pub const FILTER_ATTRIBUTES: u32 = 0x0000_0004;
pub const FILTER_SIZE: u32 = 0x0000_0008;
pub const FILTER_LAST_WRITE: u32 = 0x0000_0010;
pub const FILTER_SECURITY: u32 = 0x0000_0100;

/// The fixed filter every watch is opened with: name, directory-name,
/// attribute, size, last-write and security changes.
pub const DEFAULT_FILTER: u32 = FILTER_FILE_NAME
    | FILTER_DIR_NAME
    | FILTER_ATTRIBUTES
    | FILTER_SIZE
    | FILTER_LAST_WRITE
    | FILTER_SECURITY;

const RECORD_HEADER_LEN: usize = 12;

/// One decoded change: a raw action code and a file name relative to the
/// watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub action: u32,
    pub name: String,
}

impl ChangeRecord {
    pub fn new(action: u32, name: impl Into<String>) -> Self {
        Self {
            action,
            name: name.into(),
        }
    }

    /// Encoded size of this record including alignment padding.
    pub fn encoded_len(&self) -> usize {
        let name_bytes = self.name.encode_utf16().count() * 2;
        (RECORD_HEADER_LEN + name_bytes + 3) & !3
    }
}

/// Encode a batch of records into `buf`, returning the number of bytes
/// written. Records that would not fit are dropped; callers size batches
/// with [`ChangeRecord::encoded_len`] beforehand so this only truncates
/// when asked to.
pub fn encode_batch(records: &[ChangeRecord], buf: &mut [u8]) -> usize {
    let mut offset = 0usize;
    let mut last_link: Option<usize> = None;

    for record in records {
        let len = record.encoded_len();
        if offset + len > buf.len() {
            break;
        }

        // Chain the previous record to this one.
        if let Some(link) = last_link {
            let delta = (offset - link) as u32;
            buf[link..link + 4].copy_from_slice(&delta.to_le_bytes());
        }

        let name_units: Vec<u16> = record.name.encode_utf16().collect();
        let name_bytes = name_units.len() * 2;

        buf[offset..offset + 4].copy_from_slice(&0u32.to_le_bytes());
        buf[offset + 4..offset + 8].copy_from_slice(&record.action.to_le_bytes());
        buf[offset + 8..offset + 12].copy_from_slice(&(name_bytes as u32).to_le_bytes());

        let mut at = offset + RECORD_HEADER_LEN;
        for unit in name_units {
            buf[at..at + 2].copy_from_slice(&unit.to_le_bytes());
            at += 2;
        }
        // Pad bytes up to the aligned record length stay zero.
        for pad in buf[at..offset + len].iter_mut() {
            *pad = 0;
        }

        last_link = Some(offset);
        offset += len;
    }

    offset
}

/// Decode a batch of records from `buf`.
pub fn decode_batch(buf: &[u8]) -> Vec<ChangeRecord> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    loop {
        if offset + RECORD_HEADER_LEN > buf.len() {
            break;
        }
        let next = read_u32(buf, offset) as usize;
        let action = read_u32(buf, offset + 4);
        let name_len = read_u32(buf, offset + 8) as usize;

        let name_start = offset + RECORD_HEADER_LEN;
        let name_end = name_start + name_len;
        if name_len % 2 != 0 || name_end > buf.len() {
            break;
        }

        let units: Vec<u16> = buf[name_start..name_end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        records.push(ChangeRecord {
            action,
            name: String::from_utf16_lossy(&units),
        });

        if next == 0 {
            break;
        }
        offset += next;
    }

    records
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
