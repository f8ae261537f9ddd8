//! Write-ahead log layer: transactions over the record store
//!
//! The log layer buffers mutations in memory and gives them all-or-nothing
//! semantics through careful commit ordering:
//!
//! 1. serialize: all buffered entries plus a commit marker, in one buffer
//! 2. append:    write the buffer to the log volume
//! 3. sync:      the marker reaches persistent storage
//! 4. apply:     entries land in the record store
//! 5. truncate:  the log shrinks back to its header
//!
//! A crash before step 3 loses only uncommitted work. A crash after it
//! leaves the marker on disk, and reopening replays the batch into the
//! store; replay application is idempotent, so a crash during step 4 or 5
//! is replayed again without harm. A non-empty log therefore always means
//! "committed but possibly unapplied state exists", and replay on open is
//! the sole recovery mechanism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::Config;
use crate::engine::{Engine, Recid};
use crate::error::{StoreError, StoreResult};
use crate::format::{
    serialize_log_entry, LogEntryHeader, LogHeader, LogOp, ENTRY_MAGIC, LOG_ENTRY_HEADER_SIZE,
    LOG_HEADER_SIZE,
};
use crate::store::RecordStore;
use crate::volume::Volume;

/// One buffered mutation awaiting commit
struct TxEntry {
    op: LogOp,
    recid: Recid,
    payload: Vec<u8>,
}

/// The open transaction: ordered entries plus a latest-entry index for
/// read-your-writes lookups
#[derive(Default)]
struct TxBuffer {
    entries: Vec<TxEntry>,
    latest: HashMap<Recid, usize>,
}

impl TxBuffer {
    fn push(&mut self, op: LogOp, recid: Recid, payload: Vec<u8>) {
        self.latest.insert(recid, self.entries.len());
        self.entries.push(TxEntry { op, recid, payload });
    }

    fn pending(&self, recid: Recid) -> Option<&TxEntry> {
        self.latest.get(&recid).map(|&i| &self.entries[i])
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.latest.clear();
    }
}

/// Committed entries recovered from the log, plus what was thrown away
struct ReplayOutcome {
    committed: Vec<TxEntry>,
    discarded: usize,
}

/// Transactional engine layer owning a [`RecordStore`] and its side log.
///
/// Reads within the open transaction observe its own uncommitted entries;
/// nothing reaches the record store before `commit`. Mutations serialize
/// through the transaction mutex, which also makes `compare_and_swap`
/// atomic at this layer.
pub struct WalStore {
    store: RecordStore,
    log: Arc<dyn Volume>,
    config: Config,
    tx: Mutex<TxBuffer>,
    closed: AtomicBool,
}

impl WalStore {
    /// Open the record store on `data` and the transaction log on `log`,
    /// replaying the log first.
    ///
    /// Replay applies only batches terminated by a commit marker; a torn or
    /// corrupt tail is discarded with a warning. The log is truncated back
    /// to its header once replay has been applied and synced.
    pub fn open(
        data: Arc<dyn Volume>,
        log: Arc<dyn Volume>,
        config: Config,
    ) -> StoreResult<Self> {
        let store = RecordStore::open(data, config.clone())?;

        let log_len = log.len();
        if log_len == 0 {
            log.write_bytes(0, &LogHeader::new().to_bytes())?;
        } else {
            if log_len < LOG_HEADER_SIZE as u64 {
                return Err(StoreError::TornWrite {
                    context: "log header",
                    offset: 0,
                    expected: LOG_HEADER_SIZE as u64,
                    available: log_len,
                });
            }
            let mut header_bytes = [0u8; LOG_HEADER_SIZE];
            log.read_bytes(0, &mut header_bytes)?;
            LogHeader::from_bytes(&header_bytes).validate()?;

            let outcome = scan_log(log.as_ref(), log_len)?;
            if outcome.discarded > 0 {
                tracing::warn!(
                    entries = outcome.discarded,
                    "discarding uncommitted log tail"
                );
            }
            if !outcome.committed.is_empty() {
                tracing::debug!(
                    entries = outcome.committed.len(),
                    "replaying committed log entries"
                );
                for entry in &outcome.committed {
                    match entry.op {
                        LogOp::Allocate | LogOp::Update => {
                            store.raw_upsert(entry.recid, &entry.payload)?
                        }
                        LogOp::Delete => store.raw_delete(entry.recid)?,
                        LogOp::Commit => {}
                    }
                }
                store.commit()?;
            }
            log.truncate(LOG_HEADER_SIZE as u64)?;
        }

        Ok(Self {
            store,
            log,
            config,
            tx: Mutex::new(TxBuffer::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Entries buffered in the open transaction
    pub fn uncommitted_count(&self) -> usize {
        self.tx.lock().entries.len()
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

    fn check_capacity(&self, tx: &TxBuffer) -> StoreResult<()> {
        if tx.entries.len() >= self.config.max_uncommitted {
            return Err(StoreError::QueueFull {
                pending: tx.entries.len(),
                capacity: self.config.max_uncommitted,
            });
        }
        Ok(())
    }

    /// Current value as this transaction sees it. Caller holds the tx lock.
    fn current_locked(&self, tx: &TxBuffer, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        match tx.pending(recid) {
            Some(entry) => Ok(match entry.op {
                LogOp::Delete => None,
                _ => Some(entry.payload.clone()),
            }),
            None => self.store.get(recid),
        }
    }

    /// True when the recid is live for this transaction. Caller holds the
    /// tx lock.
    fn is_live_locked(&self, tx: &TxBuffer, recid: Recid) -> bool {
        match tx.pending(recid) {
            Some(entry) => entry.op != LogOp::Delete,
            None => self.store.contains(recid),
        }
    }

    fn apply_entries(&self, entries: &[TxEntry]) -> StoreResult<()> {
        for entry in entries {
            match entry.op {
                LogOp::Allocate | LogOp::Update => {
                    self.store.raw_upsert(entry.recid, &entry.payload)?
                }
                LogOp::Delete => self.store.raw_delete(entry.recid)?,
                LogOp::Commit => {}
            }
        }
        Ok(())
    }
}

impl Engine for WalStore {
    fn allocate(&self, payload: &[u8]) -> StoreResult<Recid> {
        self.check_open()?;
        self.check_size(payload)?;
        let mut tx = self.tx.lock();
        self.check_capacity(&tx)?;
        let recid = self.store.reserve_recid()?;
        tx.push(LogOp::Allocate, recid, payload.to_vec());
        Ok(recid)
    }

    fn get(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        {
            let tx = self.tx.lock();
            if let Some(entry) = tx.pending(recid) {
                return Ok(match entry.op {
                    LogOp::Delete => None,
                    _ => Some(entry.payload.clone()),
                });
            }
        }
        self.store.get(recid)
    }

    fn update(&self, recid: Recid, payload: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        self.check_size(payload)?;
        let mut tx = self.tx.lock();
        if !self.is_live_locked(&tx, recid) {
            return Err(StoreError::NotFound { recid });
        }
        self.check_capacity(&tx)?;
        tx.push(LogOp::Update, recid, payload.to_vec());
        Ok(())
    }

    fn compare_and_swap(&self, recid: Recid, expected: &[u8], new: &[u8]) -> StoreResult<bool> {
        self.check_open()?;
        self.check_size(new)?;
        let mut tx = self.tx.lock();
        let current = self
            .current_locked(&tx, recid)?
            .ok_or(StoreError::NotFound { recid })?;
        if current != expected {
            return Ok(false);
        }
        self.check_capacity(&tx)?;
        tx.push(LogOp::Update, recid, new.to_vec());
        Ok(true)
    }

    fn delete(&self, recid: Recid) -> StoreResult<()> {
        self.check_open()?;
        let mut tx = self.tx.lock();
        if !self.is_live_locked(&tx, recid) {
            return Err(StoreError::NotFound { recid });
        }
        self.check_capacity(&tx)?;
        tx.push(LogOp::Delete, recid, Vec::new());
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        self.check_open()?;
        let mut tx = self.tx.lock();
        if tx.entries.is_empty() {
            return self.store.commit();
        }

        let mut buf = Vec::new();
        for entry in &tx.entries {
            buf.extend_from_slice(&serialize_log_entry(entry.op, entry.recid, &entry.payload));
        }
        buf.extend_from_slice(&serialize_log_entry(LogOp::Commit, 0, &[]));

        let logged = self.log.write_bytes(LOG_HEADER_SIZE as u64, &buf).and_then(|()| {
            if self.config.sync_on_commit {
                self.log.sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = logged {
            // marker never became durable: durable state is still the last
            // successful commit; drop the partial tail, keep the buffer so
            // the caller can retry or roll back
            let _ = self.log.truncate(LOG_HEADER_SIZE as u64);
            return Err(e);
        }

        // The marker is durable, so this commit will complete on reopen even
        // if applying it fails here. The buffer stays intact on error; a
        // retried commit rewrites and reapplies the same batch.
        self.apply_entries(&tx.entries)?;
        self.store.commit()?;
        self.log.truncate(LOG_HEADER_SIZE as u64)?;
        tx.clear();
        Ok(())
    }

    fn rollback(&self) -> StoreResult<()> {
        self.check_open()?;
        self.tx.lock().clear();
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // uncommitted state dies with the engine
        self.tx.lock().clear();
        if self.config.delete_files_on_close {
            self.log.delete_backing()?;
        } else {
            self.log.close()?;
        }
        self.store.close()
    }
}

/// Walk the log collecting complete batches. Stops at the first torn or
/// corrupt entry: the commit marker is written after its batch and synced,
/// so nothing beyond a tear can belong to a committed batch.
fn scan_log(log: &dyn Volume, log_len: u64) -> StoreResult<ReplayOutcome> {
    let mut committed = Vec::new();
    let mut batch: Vec<TxEntry> = Vec::new();
    let mut pos = LOG_HEADER_SIZE as u64;

    loop {
        if pos + LOG_ENTRY_HEADER_SIZE as u64 > log_len {
            if pos < log_len {
                tracing::warn!(offset = pos, "torn log entry header");
            }
            break;
        }

        let mut header_bytes = [0u8; LOG_ENTRY_HEADER_SIZE];
        log.read_bytes(pos, &mut header_bytes)?;
        let header = LogEntryHeader::from_bytes(&header_bytes);

        if header.magic != ENTRY_MAGIC {
            tracing::warn!(offset = pos, "log scan stopped at bad entry magic");
            break;
        }
        let op = match LogOp::from_u8(header.op) {
            Some(op) => op,
            None => {
                tracing::warn!(offset = pos, op = header.op, "log scan stopped at unknown op");
                break;
            }
        };
        if op != LogOp::Commit && header.recid == 0 {
            tracing::warn!(offset = pos, "log scan stopped at entry without recid");
            break;
        }

        let body = pos + LOG_ENTRY_HEADER_SIZE as u64;
        if body + header.payload_len as u64 > log_len {
            tracing::warn!(offset = pos, "torn log entry payload");
            break;
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        log.read_bytes(body, &mut payload)?;

        let computed = crc32c::crc32c(&payload);
        if computed != header.checksum {
            tracing::warn!(offset = pos, "log scan stopped at checksum mismatch");
            break;
        }

        pos = body + header.payload_len as u64;
        if op == LogOp::Commit {
            committed.append(&mut batch);
        } else {
            batch.push(TxEntry { op, recid: header.recid, payload });
        }
    }

    Ok(ReplayOutcome { discarded: batch.len(), committed })
}
