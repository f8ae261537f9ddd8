//! Write-behind cache layer: asynchronous flush to the wrapped engine
//!
//! Mutations land in an in-memory queue and return immediately; a
//! background thread drains the queue into the wrapped engine on a
//! configured cadence. Reads consult the queue first, so a caller always
//! observes its own writes. `commit` drains the queue synchronously and
//! then commits the wrapped engine, so commit durability is exactly the
//! wrapped engine's.
//!
//! Allocation stays fast by drawing recids from a pool the background
//! thread keeps topped up: pool recids are pre-allocated in the wrapped
//! engine as empty records, so every queued entry refers to a record that
//! already exists below and the flush never has to create one. When the
//! pool runs dry the caller falls back to a synchronous allocation.
//!
//! A failed background flush leaves its entries queued for retry and
//! parks the error; the next caller operation returns it as
//! [`StoreError::FlushFailed`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::Config;
use crate::engine::{Engine, Recid};
use crate::error::{StoreError, StoreResult};

/// One queued mutation awaiting flush
#[derive(Clone, PartialEq)]
enum Pending {
    Write(Vec<u8>),
    Tombstone,
}

/// State shared between callers and the flush thread
struct Shared {
    inner: Arc<dyn Engine>,
    config: Config,
    /// Latest pending mutation per recid
    queue: Mutex<HashMap<Recid, Pending>>,
    /// Recids pre-allocated in the wrapped engine, ready to hand out
    pool: Mutex<Vec<Recid>>,
    /// First unreported background failure
    flush_error: Mutex<Option<StoreError>>,
    /// Serializes drains so the flush thread and a committing caller
    /// never apply the same entry twice
    flush_lock: Mutex<()>,
    /// Entries applied to the wrapped engine since open
    flushed_total: AtomicU64,
}

/// Handle to the running flush thread. Dropping it signals the thread
/// to stop and waits for it.
struct FlushHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlushHandle {
    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write-behind engine layer over any [`Engine`].
pub struct WriteBehind {
    shared: Arc<Shared>,
    worker: Mutex<FlushHandle>,
    closed: AtomicBool,
}

impl WriteBehind {
    /// Wrap `inner` with an asynchronous write queue and start the flush
    /// thread. The recid pool is filled before this returns, so early
    /// allocations never block on the wrapped engine.
    pub fn start(inner: Arc<dyn Engine>, config: Config) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|reason| StoreError::InvalidConfig { reason })?;

        let shared = Arc::new(Shared {
            inner,
            config,
            queue: Mutex::new(HashMap::new()),
            pool: Mutex::new(Vec::new()),
            flush_error: Mutex::new(None),
            flush_lock: Mutex::new(()),
            flushed_total: AtomicU64::new(0),
        });
        refill_pool(&shared);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let shared_clone = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name("lodestore-flush".to_string())
            .spawn(move || {
                flush_loop(shared_clone, shutdown_clone);
            })
            .map_err(|e| StoreError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: format!("failed to spawn flush thread: {}", e),
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(FlushHandle { shutdown, thread: Some(thread) }),
            closed: AtomicBool::new(false),
        })
    }

    /// Mutations queued but not yet applied to the wrapped engine
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Entries applied to the wrapped engine since open
    pub fn flushed_total(&self) -> u64 {
        self.shared.flushed_total.load(Ordering::Relaxed)
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_size(&self, payload: &[u8]) -> StoreResult<()> {
        if payload.len() > self.shared.config.max_record_size {
            return Err(StoreError::Oversized {
                size: payload.len() as u64,
                limit: self.shared.config.max_record_size as u64,
            });
        }
        Ok(())
    }

    /// Report a parked background failure to the caller, once
    fn surface_flush_error(&self) -> StoreResult<()> {
        match self.shared.flush_error.lock().take() {
            Some(e) => Err(StoreError::FlushFailed { message: e.to_string() }),
            None => Ok(()),
        }
    }

    /// Reject growth beyond the queue capacity. Overwriting an entry that
    /// is already queued does not grow the queue and is always allowed.
    fn check_capacity(&self, queue: &HashMap<Recid, Pending>, recid: Recid) -> StoreResult<()> {
        if !queue.contains_key(&recid) && queue.len() >= self.shared.config.write_queue_capacity {
            return Err(StoreError::QueueFull {
                pending: queue.len(),
                capacity: self.shared.config.write_queue_capacity,
            });
        }
        Ok(())
    }
}

impl Engine for WriteBehind {
    fn allocate(&self, payload: &[u8]) -> StoreResult<Recid> {
        self.check_open()?;
        self.surface_flush_error()?;
        self.check_size(payload)?;
        {
            let queue = self.shared.queue.lock();
            if queue.len() >= self.shared.config.write_queue_capacity {
                return Err(StoreError::QueueFull {
                    pending: queue.len(),
                    capacity: self.shared.config.write_queue_capacity,
                });
            }
        }
        let recid = match self.shared.pool.lock().pop() {
            Some(recid) => recid,
            // pool ran dry between flush cycles: allocate synchronously
            None => self.shared.inner.allocate(&[])?,
        };
        self.shared
            .queue
            .lock()
            .insert(recid, Pending::Write(payload.to_vec()));
        Ok(recid)
    }

    fn get(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.surface_flush_error()?;
        {
            let queue = self.shared.queue.lock();
            match queue.get(&recid) {
                Some(Pending::Write(payload)) => return Ok(Some(payload.clone())),
                Some(Pending::Tombstone) => return Ok(None),
                None => {}
            }
        }
        self.shared.inner.get(recid)
    }

    fn update(&self, recid: Recid, payload: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        self.surface_flush_error()?;
        self.check_size(payload)?;
        let mut queue = self.shared.queue.lock();
        match queue.get(&recid) {
            Some(Pending::Tombstone) => return Err(StoreError::NotFound { recid }),
            Some(Pending::Write(_)) => {}
            None => {
                if self.shared.inner.get(recid)?.is_none() {
                    return Err(StoreError::NotFound { recid });
                }
            }
        }
        self.check_capacity(&queue, recid)?;
        queue.insert(recid, Pending::Write(payload.to_vec()));
        Ok(())
    }

    fn compare_and_swap(&self, recid: Recid, expected: &[u8], new: &[u8]) -> StoreResult<bool> {
        self.check_open()?;
        self.surface_flush_error()?;
        self.check_size(new)?;
        // the queue mutex is held across read and write, which is what
        // makes the swap atomic at this layer
        let mut queue = self.shared.queue.lock();
        let current = match queue.get(&recid) {
            Some(Pending::Write(payload)) => payload.clone(),
            Some(Pending::Tombstone) => return Err(StoreError::NotFound { recid }),
            None => self
                .shared
                .inner
                .get(recid)?
                .ok_or(StoreError::NotFound { recid })?,
        };
        if current != expected {
            return Ok(false);
        }
        self.check_capacity(&queue, recid)?;
        queue.insert(recid, Pending::Write(new.to_vec()));
        Ok(true)
    }

    fn delete(&self, recid: Recid) -> StoreResult<()> {
        self.check_open()?;
        self.surface_flush_error()?;
        let mut queue = self.shared.queue.lock();
        match queue.get(&recid) {
            Some(Pending::Tombstone) => return Err(StoreError::NotFound { recid }),
            Some(Pending::Write(_)) => {}
            None => {
                if self.shared.inner.get(recid)?.is_none() {
                    return Err(StoreError::NotFound { recid });
                }
            }
        }
        self.check_capacity(&queue, recid)?;
        queue.insert(recid, Pending::Tombstone);
        Ok(())
    }

    fn commit(&self) -> StoreResult<()> {
        self.check_open()?;
        self.surface_flush_error()?;
        drain(&self.shared)?;
        self.shared.inner.commit()
    }

    fn rollback(&self) -> StoreResult<()> {
        // queued entries may already be half flushed; there is no point
        // this layer can roll back to
        Err(StoreError::Unsupported { operation: "rollback on a write-behind layer" })
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.worker.lock().shutdown();
        drain(&self.shared)?;

        // unused pool recids would otherwise survive as empty records
        let unused: Vec<Recid> = std::mem::take(&mut *self.shared.pool.lock());
        for recid in unused {
            self.shared.inner.delete(recid)?;
        }
        self.shared.inner.commit()?;
        self.shared.inner.close()
    }
}

/// Top the recid pool back up to its configured batch size. Failures are
/// logged and left for the synchronous fallback path to surface.
fn refill_pool(shared: &Shared) {
    loop {
        let need = {
            let pool = shared.pool.lock();
            shared.config.recid_pool_batch.saturating_sub(pool.len())
        };
        if need == 0 {
            return;
        }
        match shared.inner.allocate(&[]) {
            Ok(recid) => shared.pool.lock().push(recid),
            Err(e) => {
                tracing::warn!(error = %e, "recid pool refill failed");
                return;
            }
        }
    }
}

/// Apply every queued entry to the wrapped engine.
///
/// Entries are snapshotted under the queue lock, applied without it, and
/// removed only if the queue still holds the exact entry that was applied.
/// A write that lands mid-drain therefore stays queued for the next cycle,
/// and readers keep seeing the queue entry until the wrapped engine holds
/// the same bytes. Stops at the first failure; the failed entry and
/// everything after it stay queued.
fn drain(shared: &Shared) -> StoreResult<usize> {
    let _guard = shared.flush_lock.lock();

    let snapshot: Vec<(Recid, Pending)> = {
        let queue = shared.queue.lock();
        queue.iter().map(|(recid, pending)| (*recid, pending.clone())).collect()
    };

    let mut applied = 0usize;
    for (recid, pending) in snapshot {
        match &pending {
            Pending::Write(payload) => shared.inner.update(recid, payload)?,
            Pending::Tombstone => shared.inner.delete(recid)?,
        }
        let mut queue = shared.queue.lock();
        if queue.get(&recid).map_or(false, |current| *current == pending) {
            queue.remove(&recid);
        }
        applied += 1;
    }

    shared.flushed_total.fetch_add(applied as u64, Ordering::Relaxed);
    Ok(applied)
}

fn park_flush_error(shared: &Shared, error: StoreError) {
    let mut slot = shared.flush_error.lock();
    if slot.is_none() {
        *slot = Some(error);
    }
}

/// Main flush loop, runs on the background thread
fn flush_loop(shared: Arc<Shared>, shutdown: Arc<AtomicBool>) {
    let cadence = shared.config.flush_cadence;
    let poll = Duration::from_millis(10).min(cadence);

    loop {
        // sleep for the cadence, checking shutdown as we go
        let wake = Instant::now() + cadence;
        while Instant::now() < wake {
            if shutdown.load(Ordering::Acquire) {
                final_flush(&shared);
                return;
            }
            thread::sleep(poll);
        }
        if shutdown.load(Ordering::Acquire) {
            final_flush(&shared);
            return;
        }

        refill_pool(&shared);
        match drain(&shared) {
            Ok(applied) if applied > 0 => {
                tracing::debug!(applied, "background flush applied entries");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "background flush failed, entries stay queued");
                park_flush_error(&shared, e);
            }
        }
    }
}

fn final_flush(shared: &Shared) {
    if let Err(e) = drain(shared) {
        tracing::warn!(error = %e, "final flush on shutdown failed");
        park_flush_error(shared, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStore;
    use crate::volume::{FileVolume, MemVolume};
    use tempfile::TempDir;

    fn cache_fixture(cadence: Duration) -> (WriteBehind, Arc<RecordStore>) {
        let mut config = Config::ephemeral();
        config.flush_cadence = cadence;
        let store =
            Arc::new(RecordStore::open(Arc::new(MemVolume::new()), config.clone()).unwrap());
        let cache = WriteBehind::start(store.clone(), config).unwrap();
        (cache, store)
    }

    /// Cadence long enough that the flush thread never runs mid-test
    fn idle_cache() -> (WriteBehind, Arc<RecordStore>) {
        cache_fixture(Duration::from_secs(3600))
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_read_your_writes_before_flush() {
        let (cache, store) = idle_cache();

        let recid = cache.allocate(b"queued").unwrap();
        assert_eq!(cache.get(recid).unwrap(), Some(b"queued".to_vec()));
        assert_eq!(cache.pending_count(), 1);

        // the backing record exists but still holds the pool placeholder
        assert_eq!(store.get(recid).unwrap(), Some(Vec::new()));

        cache.update(recid, b"newer").unwrap();
        assert_eq!(cache.get(recid).unwrap(), Some(b"newer".to_vec()));
        assert_eq!(cache.pending_count(), 1);

        cache.close().unwrap();
    }

    #[test]
    fn test_background_flush_applies() {
        let (cache, store) = cache_fixture(Duration::from_millis(20));

        let recid = cache.allocate(b"drip").unwrap();
        assert!(wait_until(Duration::from_secs(2), || cache.pending_count() == 0));

        assert_eq!(store.get(recid).unwrap(), Some(b"drip".to_vec()));
        assert_eq!(cache.get(recid).unwrap(), Some(b"drip".to_vec()));
        assert!(cache.flushed_total() >= 1);

        cache.close().unwrap();
    }

    #[test]
    fn test_commit_drains_synchronously() {
        let (cache, store) = idle_cache();

        let a = cache.allocate(b"alpha").unwrap();
        let b = cache.allocate(b"beta").unwrap();
        cache.delete(b).unwrap();
        assert_eq!(cache.pending_count(), 2);

        cache.commit().unwrap();
        assert_eq!(cache.pending_count(), 0);
        assert_eq!(store.get(a).unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(store.get(b).unwrap(), None);

        cache.close().unwrap();
    }

    #[test]
    fn test_delete_visible_before_flush() {
        let (cache, store) = idle_cache();

        let recid = cache.allocate(b"short lived").unwrap();
        cache.commit().unwrap();
        assert_eq!(store.get(recid).unwrap(), Some(b"short lived".to_vec()));

        cache.delete(recid).unwrap();
        assert_eq!(cache.get(recid).unwrap(), None);
        // the wrapped engine still holds it until the drain
        assert_eq!(store.get(recid).unwrap(), Some(b"short lived".to_vec()));

        cache.commit().unwrap();
        assert_eq!(store.get(recid).unwrap(), None);

        // tombstoned recids reject further mutation
        assert!(matches!(cache.update(recid, b"x"), Err(StoreError::NotFound { .. })));

        cache.close().unwrap();
    }

    #[test]
    fn test_cas_through_the_queue() {
        let (cache, store) = idle_cache();

        let recid = cache.allocate(b"v1").unwrap();
        // compares against the queued value
        assert!(cache.compare_and_swap(recid, b"v1", b"v2").unwrap());
        assert!(!cache.compare_and_swap(recid, b"v1", b"v3").unwrap());

        cache.commit().unwrap();
        // compares against the flushed value
        assert!(cache.compare_and_swap(recid, b"v2", b"v3").unwrap());
        cache.commit().unwrap();
        assert_eq!(store.get(recid).unwrap(), Some(b"v3".to_vec()));

        cache.close().unwrap();
    }

    #[test]
    fn test_queue_capacity_backpressure() {
        let mut config = Config::ephemeral();
        config.flush_cadence = Duration::from_secs(3600);
        config.write_queue_capacity = 2;
        let store =
            Arc::new(RecordStore::open(Arc::new(MemVolume::new()), config.clone()).unwrap());
        let cache = WriteBehind::start(store, config).unwrap();

        let first = cache.allocate(b"1").unwrap();
        cache.allocate(b"2").unwrap();
        assert!(matches!(cache.allocate(b"3"), Err(StoreError::QueueFull { .. })));

        // overwriting a queued entry does not grow the queue
        cache.update(first, b"1b").unwrap();

        // draining clears the backpressure
        cache.commit().unwrap();
        cache.allocate(b"3").unwrap();

        cache.close().unwrap();
    }

    #[test]
    fn test_unknown_recid_errors() {
        let (cache, _store) = idle_cache();
        assert_eq!(cache.get(99).unwrap(), None);
        assert!(matches!(cache.update(99, b"x"), Err(StoreError::NotFound { .. })));
        assert!(matches!(cache.delete(99), Err(StoreError::NotFound { .. })));
        assert!(matches!(
            cache.compare_and_swap(99, b"a", b"b"),
            Err(StoreError::NotFound { .. })
        ));
        cache.close().unwrap();
    }

    #[test]
    fn test_background_failure_surfaces() {
        let (cache, store) = cache_fixture(Duration::from_millis(20));

        let recid = cache.allocate(b"stranded").unwrap();
        // fail the engine underneath the cache; the next drain cycle parks
        // the error and a caller operation reports it
        store.close().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            matches!(cache.get(recid), Err(StoreError::FlushFailed { .. }))
        }));

        // each parked error reports once; the entry stays queued and
        // reads resume between failing cycles
        assert_eq!(cache.pending_count(), 1);
        assert!(wait_until(Duration::from_secs(2), || {
            cache.get(recid).ok().flatten() == Some(b"stranded".to_vec())
        }));
    }

    #[test]
    fn test_rollback_unsupported() {
        let (cache, _store) = idle_cache();
        assert!(matches!(cache.rollback(), Err(StoreError::Unsupported { .. })));
        cache.close().unwrap();
    }

    #[test]
    fn test_close_cleans_recid_pool() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.lode");
        let mut config = Config::durable();
        config.sync_on_commit = false;

        let recid = {
            let volume = Arc::new(FileVolume::open(&path).unwrap());
            let store = Arc::new(RecordStore::open(volume, config.clone()).unwrap());
            let cache = WriteBehind::start(store, config.clone()).unwrap();
            let recid = cache.allocate(b"kept").unwrap();
            cache.commit().unwrap();
            cache.close().unwrap();
            recid
        };

        // only the caller's record survives; pool placeholders are gone
        let volume = Arc::new(FileVolume::open(&path).unwrap());
        let store = RecordStore::open(volume, config).unwrap();
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.get(recid).unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn test_closed_rejected() {
        let (cache, _store) = idle_cache();
        let recid = cache.allocate(b"x").unwrap();
        cache.close().unwrap();
        cache.close().unwrap(); // idempotent
        assert!(matches!(cache.get(recid), Err(StoreError::Closed)));
        assert!(matches!(cache.allocate(b"y"), Err(StoreError::Closed)));
    }
}
