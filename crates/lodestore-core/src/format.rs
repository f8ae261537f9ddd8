//! Binary format definitions for LodeStore volumes and logs
//!
//! Two on-disk layouts share this module: the record volume (volume header
//! followed by record slots) and the transaction log (log header followed by
//! log entries). All integers are little-endian; every payload carries a
//! CRC32C checksum for silent corruption detection.

use crate::engine::Recid;
use crate::error::{StoreError, StoreResult};

/// Record volume magic: "LODE" in ASCII
pub const VOLUME_MAGIC: [u8; 4] = [0x4C, 0x4F, 0x44, 0x45];

/// Transaction log magic: "LWAL" in ASCII
pub const LOG_MAGIC: [u8; 4] = [0x4C, 0x57, 0x41, 0x4C];

/// Record slot magic: "LREC" in ASCII
pub const SLOT_MAGIC: [u8; 4] = [0x4C, 0x52, 0x45, 0x43];

/// Log entry magic: "LLOG" in ASCII
pub const ENTRY_MAGIC: [u8; 4] = [0x4C, 0x4C, 0x4F, 0x47];

/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Record volume header size in bytes
pub const VOLUME_HEADER_SIZE: usize = 32;

/// Transaction log header size in bytes
pub const LOG_HEADER_SIZE: usize = 16;

/// Record slot header size in bytes
pub const SLOT_HEADER_SIZE: usize = 32;

/// Log entry header size in bytes
pub const LOG_ENTRY_HEADER_SIZE: usize = 24;

/// Slot payload capacities are rounded up to this granularity, so freed
/// slots form few size classes and reuse hits more often
pub const SLOT_ALIGN: usize = 16;

/// Free-slot flag bit in the slot header flags byte
pub const FLAG_SLOT_FREE: u8 = 0x01;

/// Round a payload length up to the slot capacity that will hold it.
/// Zero-length payloads still get one alignment unit so the slot stays
/// reusable.
pub fn round_capacity(payload_len: usize) -> usize {
    if payload_len == 0 {
        return SLOT_ALIGN;
    }
    payload_len.div_ceil(SLOT_ALIGN) * SLOT_ALIGN
}

/// Record volume file header.
///
/// Layout (32 bytes):
///   [0..4]   magic:    "LODE"
///   [4..8]   version:  u32 LE
///   [8..32]  reserved: zero
#[derive(Debug, Clone, Copy)]
pub struct VolumeHeader {
    pub magic: [u8; 4],
    pub version: u32,
}

impl VolumeHeader {
    pub fn new() -> Self {
        Self { magic: VOLUME_MAGIC, version: FORMAT_VERSION }
    }

    pub fn to_bytes(&self) -> [u8; VOLUME_HEADER_SIZE] {
        let mut buf = [0u8; VOLUME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; VOLUME_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self {
            magic,
            version: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Reject foreign files and future format versions
    pub fn validate(&self) -> StoreResult<()> {
        if self.magic != VOLUME_MAGIC {
            return Err(StoreError::Corrupted {
                context: "volume header",
                detail: format!("bad magic {:02x?}", self.magic),
            });
        }
        if self.version != FORMAT_VERSION {
            return Err(StoreError::Corrupted {
                context: "volume header",
                detail: format!("unsupported format version {}", self.version),
            });
        }
        Ok(())
    }
}

impl Default for VolumeHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction log file header.
///
/// Layout (16 bytes):
///   [0..4]   magic:    "LWAL"
///   [4..8]   version:  u32 LE
///   [8..16]  reserved: zero
#[derive(Debug, Clone, Copy)]
pub struct LogHeader {
    pub magic: [u8; 4],
    pub version: u32,
}

impl LogHeader {
    pub fn new() -> Self {
        Self { magic: LOG_MAGIC, version: FORMAT_VERSION }
    }

    pub fn to_bytes(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut buf = [0u8; LOG_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; LOG_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self {
            magic,
            version: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.magic != LOG_MAGIC {
            return Err(StoreError::Corrupted {
                context: "log header",
                detail: format!("bad magic {:02x?}", self.magic),
            });
        }
        if self.version != FORMAT_VERSION {
            return Err(StoreError::Corrupted {
                context: "log header",
                detail: format!("unsupported format version {}", self.version),
            });
        }
        Ok(())
    }
}

impl Default for LogHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size header for each record slot.
///
/// Layout (32 bytes):
///   [0..4]   magic:       "LREC"
///   [4..12]  recid:       u64 LE (0 for free slots)
///   [12..16] payload_len: u32 LE
///   [16..20] capacity:    u32 LE - payload bytes reserved, 16-byte rounded
///   [20..24] checksum:    u32 LE - CRC32C of payload bytes
///   [24]     flags:       u8     - bit 0 = free slot
///   [25..32] reserved:    zero
#[derive(Debug, Clone, Copy)]
pub struct SlotHeader {
    pub magic: [u8; 4],
    pub recid: Recid,
    pub payload_len: u32,
    pub capacity: u32,
    pub checksum: u32,
    pub flags: u8,
}

impl SlotHeader {
    /// Header for a live slot holding `payload_len` bytes of `capacity` reserved
    pub fn live(recid: Recid, payload_len: u32, capacity: u32, checksum: u32) -> Self {
        Self { magic: SLOT_MAGIC, recid, payload_len, capacity, checksum, flags: 0 }
    }

    /// Header stamped over a slot when its record is deleted or relocated.
    /// Capacity stays valid so open-time scans can step over the slot.
    pub fn free(capacity: u32) -> Self {
        Self {
            magic: SLOT_MAGIC,
            recid: 0,
            payload_len: 0,
            capacity,
            checksum: 0,
            flags: FLAG_SLOT_FREE,
        }
    }

    pub fn is_free(&self) -> bool {
        (self.flags & FLAG_SLOT_FREE) != 0
    }

    pub fn to_bytes(&self) -> [u8; SLOT_HEADER_SIZE] {
        let mut buf = [0u8; SLOT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..12].copy_from_slice(&self.recid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.capacity.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf[24] = self.flags;
        buf
    }

    pub fn from_bytes(bytes: &[u8; SLOT_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self {
            magic,
            recid: u64::from_le_bytes([
                bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11],
            ]),
            payload_len: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            capacity: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            checksum: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
            flags: bytes[24],
        }
    }
}

/// Log operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    /// New record allocated with a payload
    Allocate = 1,
    /// Existing record replaced with a payload
    Update = 2,
    /// Record removed
    Delete = 3,
    /// Transaction boundary; everything before it is durable
    Commit = 4,
}

impl LogOp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(LogOp::Allocate),
            2 => Some(LogOp::Update),
            3 => Some(LogOp::Delete),
            4 => Some(LogOp::Commit),
            _ => None,
        }
    }
}

/// Fixed-size header for each log entry.
///
/// Layout (24 bytes):
///   [0..4]   magic:       "LLOG"
///   [4]      op:          u8 - LogOp
///   [5..8]   reserved:    zero
///   [8..16]  recid:       u64 LE (0 for commit)
///   [16..20] payload_len: u32 LE (0 for delete/commit)
///   [20..24] checksum:    u32 LE - CRC32C of payload bytes
#[derive(Debug, Clone, Copy)]
pub struct LogEntryHeader {
    pub magic: [u8; 4],
    pub op: u8,
    pub recid: Recid,
    pub payload_len: u32,
    pub checksum: u32,
}

impl LogEntryHeader {
    pub fn new(op: LogOp, recid: Recid, payload_len: u32, checksum: u32) -> Self {
        Self { magic: ENTRY_MAGIC, op: op as u8, recid, payload_len, checksum }
    }

    pub fn to_bytes(&self) -> [u8; LOG_ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; LOG_ENTRY_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4] = self.op;
        buf[8..16].copy_from_slice(&self.recid.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; LOG_ENTRY_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self {
            magic,
            op: bytes[4],
            recid: u64::from_le_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
            ]),
            payload_len: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            checksum: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
        }
    }
}

/// Serialize one log entry: header + payload, CRC32C over the payload
pub fn serialize_log_entry(op: LogOp, recid: Recid, payload: &[u8]) -> Vec<u8> {
    let checksum = if payload.is_empty() { 0 } else { crc32c::crc32c(payload) };
    let header = LogEntryHeader::new(op, recid, payload.len() as u32, checksum);

    let mut buffer = Vec::with_capacity(LOG_ENTRY_HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(payload);
    buffer
}
