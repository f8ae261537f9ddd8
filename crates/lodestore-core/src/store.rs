//! On-volume record store: slot allocator and per-record operations
//!
//! Bottom of the engine stack. Maps recids to payload slots on a `Volume`,
//! recycles freed slot space through size-classed free lists, and verifies a
//! CRC32C checksum on every read. The store alone has no transaction
//! semantics: `commit` is a volume sync and crash consistency comes from the
//! log layer above it.
//!
//! Recids are handed out monotonically and never reused, which keeps
//! snapshot references valid without reference counting; only the space of
//! freed slots is recycled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::engine::{Engine, Recid};
use crate::error::{StoreError, StoreResult};
use crate::format::{
    round_capacity, SlotHeader, VolumeHeader, SLOT_ALIGN, SLOT_HEADER_SIZE, SLOT_MAGIC,
    VOLUME_HEADER_SIZE,
};
use crate::volume::Volume;

/// Per-recid lock stripes. Operations on recids in the same stripe
/// serialize; disjoint stripes never contend.
const STRIPE_COUNT: usize = 64;

/// Location of a live slot on the volume
#[derive(Debug, Clone, Copy)]
struct SlotLocation {
    /// Byte offset of the slot header
    offset: u64,
    /// Payload capacity reserved at this slot
    capacity: u32,
}

/// Physical allocation state, guarded by one mutex
struct Allocator {
    /// Free slots grouped by capacity class, each class a LIFO of offsets
    free: BTreeMap<u32, Vec<u64>>,
    /// Offset one past the last slot
    eof: u64,
    /// Next recid to hand out
    next_recid: Recid,
}

/// Pop the smallest free slot that holds `capacity` payload bytes, or
/// extend the volume tail with a slot of exactly that capacity.
fn take_slot(alloc: &mut Allocator, capacity: u32) -> (u64, u32) {
    let class = alloc.free.range(capacity..).next().map(|(&cap, _)| cap);
    if let Some(cap) = class {
        if let Some(offsets) = alloc.free.get_mut(&cap) {
            if let Some(offset) = offsets.pop() {
                if offsets.is_empty() {
                    alloc.free.remove(&cap);
                }
                return (offset, cap);
            }
        }
    }
    let offset = alloc.eof;
    alloc.eof += (SLOT_HEADER_SIZE + capacity as usize) as u64;
    (offset, capacity)
}

/// Record store over a byte volume.
///
/// All public methods take `&self` for concurrent access. Reads on one recid
/// run concurrently; mutations of a recid serialize through its lock stripe,
/// and `compare_and_swap` holds the stripe across the byte comparison and
/// the replacing write, which makes it the atomic primitive the tree layers
/// build on. Allocation metadata is serialized separately so mutations of
/// disjoint recids never wait on each other for payload writes.
pub struct RecordStore {
    volume: Arc<dyn Volume>,
    config: Config,
    /// recid → live slot
    index: RwLock<HashMap<Recid, SlotLocation>>,
    /// free lists, end-of-volume, recid watermark
    alloc: Mutex<Allocator>,
    /// per-recid lock stripes
    stripes: Vec<RwLock<()>>,
    closed: AtomicBool,
}

impl RecordStore {
    /// Open a record store over `volume`.
    ///
    /// An empty volume is initialized with a fresh header. A non-empty one
    /// is scanned slot by slot to rebuild the index, the free lists, and the
    /// recid watermark; a torn or corrupt tail is discarded with a warning
    /// rather than failing the open.
    pub fn open(volume: Arc<dyn Volume>, config: Config) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|reason| StoreError::InvalidConfig { reason })?;

        let mut index = HashMap::new();
        let mut free: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        let mut next_recid: Recid = 1;
        let mut offset = VOLUME_HEADER_SIZE as u64;

        let volume_len = volume.len();
        if volume_len == 0 {
            volume.write_bytes(0, &VolumeHeader::new().to_bytes())?;
        } else {
            if volume_len < VOLUME_HEADER_SIZE as u64 {
                return Err(StoreError::Corrupted {
                    context: "volume header",
                    detail: format!("volume is {} bytes, header needs {}", volume_len, VOLUME_HEADER_SIZE),
                });
            }
            let mut header_bytes = [0u8; VOLUME_HEADER_SIZE];
            volume.read_bytes(0, &mut header_bytes)?;
            VolumeHeader::from_bytes(&header_bytes).validate()?;

            while offset + SLOT_HEADER_SIZE as u64 <= volume_len {
                let mut slot_bytes = [0u8; SLOT_HEADER_SIZE];
                volume.read_bytes(offset, &mut slot_bytes)?;
                let header = SlotHeader::from_bytes(&slot_bytes);

                let shape_ok = header.magic == SLOT_MAGIC
                    && header.capacity != 0
                    && header.capacity as usize % SLOT_ALIGN == 0
                    && (header.is_free()
                        || (header.recid != 0 && header.payload_len <= header.capacity));
                if !shape_ok {
                    break;
                }

                let end = offset + (SLOT_HEADER_SIZE + header.capacity as usize) as u64;
                if end > volume_len {
                    break;
                }

                if header.is_free() {
                    free.entry(header.capacity).or_default().push(offset);
                } else if index.contains_key(&header.recid) {
                    tracing::warn!(
                        recid = header.recid,
                        offset,
                        "duplicate live slot ignored during volume scan"
                    );
                } else {
                    index.insert(header.recid, SlotLocation { offset, capacity: header.capacity });
                    next_recid = next_recid.max(header.recid + 1);
                }
                offset = end;
            }

            if offset < volume_len {
                tracing::warn!(
                    kept = offset,
                    discarded = volume_len - offset,
                    "discarding torn volume tail"
                );
                volume.truncate(offset)?;
            }
        }

        let stripes = (0..STRIPE_COUNT).map(|_| RwLock::new(())).collect();

        Ok(Self {
            volume,
            config,
            index: RwLock::new(index),
            alloc: Mutex::new(Allocator { free, eof: offset, next_recid }),
            stripes,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of live records
    pub fn record_count(&self) -> usize {
        self.index.read().len()
    }

    /// Number of freed slots awaiting reuse
    pub fn free_slot_count(&self) -> usize {
        self.alloc.lock().free.values().map(Vec::len).sum()
    }

    /// True when `recid` has a live slot
    pub(crate) fn contains(&self, recid: Recid) -> bool {
        self.index.read().contains_key(&recid)
    }

    /// Reserve the next recid without touching the volume.
    ///
    /// The log layer assigns recids at `allocate` time but defers the slot
    /// write to commit; a reservation that never commits just leaves a gap
    /// in the monotonic sequence.
    pub(crate) fn reserve_recid(&self) -> StoreResult<Recid> {
        self.check_open()?;
        let mut alloc = self.alloc.lock();
        let recid = alloc.next_recid;
        alloc.next_recid += 1;
        Ok(recid)
    }

    /// Write `payload` under `recid` whether or not the recid is live yet.
    /// Used by log replay and commit application, where the recid was
    /// assigned when the entry was logged.
    pub(crate) fn raw_upsert(&self, recid: Recid, payload: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        self.check_size(payload)?;
        let _guard = self.stripe(recid).write();

        let existing = self.index.read().get(&recid).copied();
        match existing {
            Some(loc) => self.write_payload_locked(recid, loc, payload),
            None => {
                let capacity = round_capacity(payload.len()) as u32;
                let (offset, capacity) = {
                    let mut alloc = self.alloc.lock();
                    alloc.next_recid = alloc.next_recid.max(recid + 1);
                    take_slot(&mut alloc, capacity)
                };
                self.write_live_slot(recid, offset, capacity, payload)?;
                self.index.write().insert(recid, SlotLocation { offset, capacity });
                Ok(())
            }
        }
    }

    /// Remove `recid` if it is live; absent recids are fine. Used by log
    /// replay, which may apply the same delete twice.
    pub(crate) fn raw_delete(&self, recid: Recid) -> StoreResult<()> {
        self.check_open()?;
        let _guard = self.stripe(recid).write();
        let loc = match self.index.read().get(&recid).copied() {
            Some(loc) => loc,
            None => return Ok(()),
        };
        self.free_slot_locked(recid, loc)
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_size(&self, payload: &[u8]) -> StoreResult<()> {
        if payload.len() > self.config.max_record_size {
            return Err(StoreError::Oversized {
                size: payload.len() as u64,
                limit: self.config.max_record_size as u64,
            });
        }
        Ok(())
    }

    fn stripe(&self, recid: Recid) -> &RwLock<()> {
        &self.stripes[(recid % STRIPE_COUNT as u64) as usize]
    }

    /// Read and verify the payload at a known slot. Caller holds the stripe.
    fn read_slot(&self, recid: Recid, loc: SlotLocation) -> StoreResult<Vec<u8>> {
        let mut header_bytes = [0u8; SLOT_HEADER_SIZE];
        self.volume.read_bytes(loc.offset, &mut header_bytes)?;
        let header = SlotHeader::from_bytes(&header_bytes);

        if header.magic != SLOT_MAGIC {
            return Err(StoreError::Corrupted {
                context: "record slot",
                detail: format!("bad magic {:02x?} at offset {}", header.magic, loc.offset),
            });
        }
        if header.is_free() || header.recid != recid {
            return Err(StoreError::Corrupted {
                context: "record slot",
                detail: format!(
                    "slot at offset {} belongs to recid {}, expected {}",
                    loc.offset, header.recid, recid
                ),
            });
        }
        if header.payload_len > header.capacity {
            return Err(StoreError::Corrupted {
                context: "record slot",
                detail: format!(
                    "payload length {} exceeds slot capacity {}",
                    header.payload_len, header.capacity
                ),
            });
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        self.volume.read_bytes(loc.offset + SLOT_HEADER_SIZE as u64, &mut payload)?;

        let computed = crc32c::crc32c(&payload);
        if computed != header.checksum {
            return Err(StoreError::ChecksumMismatch {
                context: "record slot",
                expected: header.checksum,
                actual: computed,
                offset: loc.offset + SLOT_HEADER_SIZE as u64,
            });
        }

        Ok(payload)
    }

    /// Write a live slot header plus payload in one volume write
    fn write_live_slot(
        &self,
        recid: Recid,
        offset: u64,
        capacity: u32,
        payload: &[u8],
    ) -> StoreResult<()> {
        let checksum = crc32c::crc32c(payload);
        let header = SlotHeader::live(recid, payload.len() as u32, capacity, checksum);

        let mut buf = Vec::with_capacity(SLOT_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(payload);
        self.volume.write_bytes(offset, &buf)
    }

    /// Replace the payload of a live recid. Caller holds the stripe write
    /// lock. Rewrites in place when the slot capacity suffices; otherwise
    /// frees the old slot before the new one goes live, so the volume never
    /// holds two live slots for one recid.
    fn write_payload_locked(
        &self,
        recid: Recid,
        loc: SlotLocation,
        payload: &[u8],
    ) -> StoreResult<()> {
        let needed = round_capacity(payload.len()) as u32;
        if needed <= loc.capacity {
            return self.write_live_slot(recid, loc.offset, loc.capacity, payload);
        }

        self.volume
            .write_bytes(loc.offset, &SlotHeader::free(loc.capacity).to_bytes())?;
        let (offset, capacity) = {
            let mut alloc = self.alloc.lock();
            alloc.free.entry(loc.capacity).or_default().push(loc.offset);
            take_slot(&mut alloc, needed)
        };
        self.write_live_slot(recid, offset, capacity, payload)?;
        self.index.write().insert(recid, SlotLocation { offset, capacity });
        Ok(())
    }

    /// Stamp a slot free on the volume, then drop it from the index and
    /// push it on the free list. Caller holds the stripe write lock.
    fn free_slot_locked(&self, recid: Recid, loc: SlotLocation) -> StoreResult<()> {
        self.volume
            .write_bytes(loc.offset, &SlotHeader::free(loc.capacity).to_bytes())?;
        self.index.write().remove(&recid);
        self.alloc.lock().free.entry(loc.capacity).or_default().push(loc.offset);
        Ok(())
    }
}

impl Engine for RecordStore {
    fn allocate(&self, payload: &[u8]) -> StoreResult<Recid> {
        self.check_open()?;
        self.check_size(payload)?;

        let capacity = round_capacity(payload.len()) as u32;
        let (recid, offset, capacity) = {
            let mut alloc = self.alloc.lock();
            let recid = alloc.next_recid;
            alloc.next_recid += 1;
            let (offset, capacity) = take_slot(&mut alloc, capacity);
            (recid, offset, capacity)
        };

        self.write_live_slot(recid, offset, capacity, payload)?;
        self.index.write().insert(recid, SlotLocation { offset, capacity });
        Ok(recid)
    }

    fn get(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        let _guard = self.stripe(recid).read();
        let loc = match self.index.read().get(&recid).copied() {
            Some(loc) => loc,
            None => return Ok(None),
        };
        self.read_slot(recid, loc).map(Some)
    }

    fn update(&self, recid: Recid, payload: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        self.check_size(payload)?;
        let _guard = self.stripe(recid).write();
        let loc = self
            .index
            .read()
            .get(&recid)
            .copied()
            .ok_or(StoreError::NotFound { recid })?;
        self.write_payload_locked(recid, loc, payload)
    }

    fn compare_and_swap(&self, recid: Recid, expected: &[u8], new: &[u8]) -> StoreResult<bool> {
        self.check_open()?;
        self.check_size(new)?;
        let _guard = self.stripe(recid).write();
        let loc = self
            .index
            .read()
            .get(&recid)
            .copied()
            .ok_or(StoreError::NotFound { recid })?;

        let current = self.read_slot(recid, loc)?;
        if current != expected {
            return Ok(false);
        }
        self.write_payload_locked(recid, loc, new)?;
        Ok(true)
    }

    fn delete(&self, recid: Recid) -> StoreResult<()> {
        self.check_open()?;
        let _guard = self.stripe(recid).write();
        let loc = self
            .index
            .read()
            .get(&recid)
            .copied()
            .ok_or(StoreError::NotFound { recid })?;
        self.free_slot_locked(recid, loc)
    }

    fn commit(&self) -> StoreResult<()> {
        self.check_open()?;
        if self.config.sync_on_commit {
            self.volume.sync()?;
        }
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        self.check_open()?;
        Err(StoreError::Unsupported { operation: "rollback" })
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.config.delete_files_on_close {
            self.volume.delete_backing()
        } else {
            self.volume.close()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{FileVolume, MemVolume};
    use std::path::Path;
    use tempfile::TempDir;

    fn test_store() -> RecordStore {
        RecordStore::open(Arc::new(MemVolume::new()), Config::ephemeral()).unwrap()
    }

    fn file_store(path: &Path) -> RecordStore {
        let volume = Arc::new(FileVolume::open(path).unwrap());
        RecordStore::open(volume, Config::durable()).unwrap()
    }

    #[test]
    fn test_allocate_get() {
        let store = test_store();
        let recid = store.allocate(b"hello").unwrap();
        assert!(recid > 0);
        assert_eq!(store.get(recid).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_empty_payload_distinct_from_absent() {
        let store = test_store();
        let recid = store.allocate(&[]).unwrap();
        assert_eq!(store.get(recid).unwrap(), Some(Vec::new()));
        assert_eq!(store.get(recid + 1).unwrap(), None);
    }

    #[test]
    fn test_unknown_recid_errors() {
        let store = test_store();
        assert_eq!(store.get(99).unwrap(), None);
        assert!(matches!(store.update(99, b"x"), Err(StoreError::NotFound { recid: 99 })));
        assert!(matches!(store.delete(99), Err(StoreError::NotFound { recid: 99 })));
        assert!(matches!(
            store.compare_and_swap(99, b"a", b"b"),
            Err(StoreError::NotFound { recid: 99 })
        ));
    }

    #[test]
    fn test_update_in_place() {
        let store = test_store();
        let recid = store.allocate(&[1u8; 100]).unwrap();
        let len_before = store.free_slot_count();

        // 50 bytes rounds to 64, fits the 112-byte slot
        store.update(recid, &[2u8; 50]).unwrap();
        assert_eq!(store.get(recid).unwrap(), Some(vec![2u8; 50]));
        assert_eq!(store.free_slot_count(), len_before);
    }

    #[test]
    fn test_update_relocates_and_frees() {
        let store = test_store();
        let recid = store.allocate(&[1u8; 16]).unwrap();
        store.update(recid, &[2u8; 100]).unwrap();

        assert_eq!(store.get(recid).unwrap(), Some(vec![2u8; 100]));
        assert_eq!(store.free_slot_count(), 1);

        // the freed 16-byte slot is reused by the next small allocation
        store.allocate(&[3u8; 10]).unwrap();
        assert_eq!(store.free_slot_count(), 0);
    }

    #[test]
    fn test_delete_frees_slot() {
        let store = test_store();
        let recid = store.allocate(b"gone soon").unwrap();
        store.delete(recid).unwrap();

        assert_eq!(store.get(recid).unwrap(), None);
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.free_slot_count(), 1);
    }

    #[test]
    fn test_recids_never_reused() {
        let store = test_store();
        let first = store.allocate(b"a").unwrap();
        store.delete(first).unwrap();
        let second = store.allocate(b"b").unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_cas_success_and_miss() {
        let store = test_store();
        let recid = store.allocate(b"v1").unwrap();

        assert!(store.compare_and_swap(recid, b"v1", b"v2").unwrap());
        assert_eq!(store.get(recid).unwrap(), Some(b"v2".to_vec()));

        // stale expected value: miss, no change
        assert!(!store.compare_and_swap(recid, b"v1", b"v3").unwrap());
        assert_eq!(store.get(recid).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_cas_single_winner() {
        let store = Arc::new(test_store());
        let recid = store.allocate(b"base").unwrap();

        let mut handles = vec![];
        for i in 0..8u8 {
            let s = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                s.compare_and_swap(recid, b"base", &[i]).unwrap()
            }));
        }

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);

        let value = store.get(recid).unwrap().unwrap();
        assert_eq!(value.len(), 1);
    }

    #[test]
    fn test_oversized_rejected() {
        let volume = Arc::new(MemVolume::new());
        let mut config = Config::ephemeral();
        config.max_record_size = 64;
        let store = RecordStore::open(volume, config).unwrap();

        let big = vec![0u8; 65];
        assert!(matches!(store.allocate(&big), Err(StoreError::Oversized { .. })));

        let recid = store.allocate(b"small").unwrap();
        assert!(matches!(store.update(recid, &big), Err(StoreError::Oversized { .. })));
    }

    #[test]
    fn test_rollback_unsupported() {
        let store = test_store();
        assert!(matches!(store.rollback(), Err(StoreError::Unsupported { .. })));
    }

    #[test]
    fn test_closed_rejected() {
        let store = test_store();
        let recid = store.allocate(b"x").unwrap();
        store.close().unwrap();
        store.close().unwrap(); // idempotent

        assert!(matches!(store.get(recid), Err(StoreError::Closed)));
        assert!(matches!(store.allocate(b"y"), Err(StoreError::Closed)));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let volume = Arc::new(MemVolume::new());
        let store = RecordStore::open(volume.clone(), Config::ephemeral()).unwrap();
        let recid = store.allocate(b"precious").unwrap();

        // first slot payload begins after the volume header and slot header
        let payload_offset = (VOLUME_HEADER_SIZE + SLOT_HEADER_SIZE) as u64;
        volume.write_bytes(payload_offset, &[0xFF]).unwrap();

        assert!(matches!(
            store.get(recid),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_slot_magic_detected() {
        let volume = Arc::new(MemVolume::new());
        let store = RecordStore::open(volume.clone(), Config::ephemeral()).unwrap();
        let recid = store.allocate(b"precious").unwrap();

        volume.write_bytes(VOLUME_HEADER_SIZE as u64, &[0xFF]).unwrap();

        assert!(matches!(store.get(recid), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.lode");

        let (r1, r2);
        {
            let store = file_store(&path);
            r1 = store.allocate(b"first").unwrap();
            r2 = store.allocate(b"second").unwrap();
            store.delete(r1).unwrap();
            store.commit().unwrap();
            store.close().unwrap();
        }

        let store = file_store(&path);
        assert_eq!(store.get(r1).unwrap(), None);
        assert_eq!(store.get(r2).unwrap(), Some(b"second".to_vec()));
        assert_eq!(store.free_slot_count(), 1);

        // watermark continues past everything seen on disk
        let r3 = store.allocate(b"third").unwrap();
        assert!(r3 > r2);
    }

    #[test]
    fn test_torn_tail_discarded_on_open() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.lode");

        {
            let store = file_store(&path);
            store.allocate(b"kept one").unwrap();
            store.allocate(b"kept two").unwrap();
            store.commit().unwrap();
            store.close().unwrap();
        }

        // simulate a crash mid-append: garbage where the next slot would be
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xAB; 17]).unwrap();
        }

        let store = file_store(&path);
        assert_eq!(store.record_count(), 2);

        // tail was truncated, so new allocations land on a clean boundary
        let recid = store.allocate(b"after recovery").unwrap();
        assert_eq!(store.get(recid).unwrap(), Some(b"after recovery".to_vec()));
    }

    #[test]
    fn test_foreign_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("not_a_store");
        std::fs::write(&path, b"this is sixty four bytes of something that is not a volume!!!!!!").unwrap();

        let volume = Arc::new(FileVolume::open(&path).unwrap());
        assert!(matches!(
            RecordStore::open(volume, Config::durable()),
            Err(StoreError::Corrupted { .. })
        ));
    }
}
