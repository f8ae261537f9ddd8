//! Snapshot layer: point-in-time read views with copy-on-first-write
//!
//! A snapshot freezes the engine's visible state at a moment without
//! copying any data up front. Each live snapshot owns an overlay; the
//! first mutation to touch a record after the snapshot was taken stores
//! the record's pre-image in every overlay that does not already hold an
//! entry for it. View reads consult the overlay first and fall through to
//! the live engine for records that have not changed since the snapshot.
//!
//! Records allocated after a snapshot get an explicit absent entry in
//! its overlay, so a view never sees them: with overlays live, the
//! record and its absent markers publish under the registry write lock,
//! and a view's fall-through read holds the read lock, so no view can
//! observe one without the other. Overlay capture and the mutation
//! itself happen under a registry read lock; taking a snapshot acquires
//! the write lock, so every mutation lands entirely before or entirely
//! after the snapshot boundary.
//!
//! Snapshot cost is proportional to the records mutated while the
//! snapshot is alive, not to the size of the store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::engine::{Engine, Recid};
use crate::error::{StoreError, StoreResult};

/// Pre-images captured for one snapshot. `None` means the record did not
/// exist when the snapshot was taken.
#[derive(Default)]
struct Overlay {
    entries: Mutex<HashMap<Recid, Option<Vec<u8>>>>,
}

/// All overlays currently alive. The RwLock doubles as the snapshot
/// boundary: mutations and view fall-through reads hold it shared,
/// snapshot creation and release hold it exclusively, and so does
/// allocation while any overlay is live.
struct Registry {
    overlays: RwLock<HashMap<u64, Arc<Overlay>>>,
    next_id: AtomicU64,
}

/// Snapshot-capable engine layer over any [`Engine`].
///
/// Mutations pass straight through to the wrapped engine after capturing
/// pre-images for live snapshots; with no snapshots open the overhead is
/// one uncontended read lock per mutation.
pub struct SnapshotEngine {
    inner: Arc<dyn Engine>,
    registry: Arc<Registry>,
    closed: AtomicBool,
}

impl SnapshotEngine {
    /// Wrap `inner` with snapshot support.
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self {
            inner,
            registry: Arc::new(Registry {
                overlays: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Freeze the current state and return a read-only view of it.
    ///
    /// The view stays valid until it is closed or dropped, whichever
    /// comes first. Closing this engine while views are alive leaves them
    /// able to serve only records their overlay already captured.
    pub fn snapshot(&self) -> StoreResult<SnapshotView> {
        self.check_open()?;
        let mut overlays = self.registry.overlays.write();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let overlay = Arc::new(Overlay::default());
        overlays.insert(id, Arc::clone(&overlay));
        Ok(SnapshotView {
            id,
            overlay,
            registry: Arc::clone(&self.registry),
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        })
    }

    /// Snapshots currently holding an overlay
    pub fn live_snapshot_count(&self) -> usize {
        self.registry.overlays.read().len()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Store the record's current value into every overlay that has not
    /// captured it yet. Holding each overlay's mutex across the read and
    /// insert keeps a concurrent mutator from capturing its own
    /// post-image.
    fn capture_preimages(
        &self,
        overlays: &HashMap<u64, Arc<Overlay>>,
        recid: Recid,
    ) -> StoreResult<()> {
        for overlay in overlays.values() {
            let mut entries = overlay.entries.lock();
            if !entries.contains_key(&recid) {
                let preimage = self.inner.get(recid)?;
                entries.insert(recid, preimage);
            }
        }
        Ok(())
    }
}

impl Engine for SnapshotEngine {
    fn allocate(&self, payload: &[u8]) -> StoreResult<Recid> {
        self.check_open()?;
        let overlays = self.registry.overlays.upgradable_read();
        if overlays.is_empty() {
            // the guard keeps a snapshot from landing mid-allocation
            return self.inner.allocate(payload);
        }
        // records born after a snapshot are absent from its view; the
        // write lock publishes the record and its markers as one step,
        // closing the window where a view read could glimpse the record
        // before its marker exists
        let overlays = RwLockUpgradableReadGuard::upgrade(overlays);
        let recid = self.inner.allocate(payload)?;
        for overlay in overlays.values() {
            overlay.entries.lock().entry(recid).or_insert(None);
        }
        Ok(recid)
    }

    fn get(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.inner.get(recid)
    }

    fn update(&self, recid: Recid, payload: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        let overlays = self.registry.overlays.read();
        self.capture_preimages(&overlays, recid)?;
        self.inner.update(recid, payload)
    }

    fn compare_and_swap(&self, recid: Recid, expected: &[u8], new: &[u8]) -> StoreResult<bool> {
        self.check_open()?;
        let overlays = self.registry.overlays.read();
        // captured even when the swap loses: the pre-image is the
        // snapshot-time value either way
        self.capture_preimages(&overlays, recid)?;
        self.inner.compare_and_swap(recid, expected, new)
    }

    fn delete(&self, recid: Recid) -> StoreResult<()> {
        self.check_open()?;
        let overlays = self.registry.overlays.read();
        self.capture_preimages(&overlays, recid)?;
        self.inner.delete(recid)
    }

    fn commit(&self) -> StoreResult<()> {
        self.check_open()?;
        self.inner.commit()
    }

    fn rollback(&self) -> StoreResult<()> {
        self.check_open()?;
        self.inner.rollback()
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.close()
    }
}

/// Read-only view of the engine as it was when [`SnapshotEngine::snapshot`]
/// was called.
///
/// Implements [`Engine`] so snapshot reads run through the same code paths
/// as live reads; every mutation returns [`StoreError::ReadOnly`]. `commit`
/// and `rollback` are accepted as no-ops so engine-generic callers need no
/// special casing. Dropping the view releases its overlay.
pub struct SnapshotView {
    id: u64,
    overlay: Arc<Overlay>,
    registry: Arc<Registry>,
    inner: Arc<dyn Engine>,
    closed: AtomicBool,
}

impl SnapshotView {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Engine for SnapshotView {
    fn allocate(&self, _payload: &[u8]) -> StoreResult<Recid> {
        Err(StoreError::ReadOnly)
    }

    fn get(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        // held across the fall-through: an in-flight allocation publishes
        // its record and absent markers under the write lock, never halfway
        let _overlays = self.registry.overlays.read();
        {
            let entries = self.overlay.entries.lock();
            if let Some(preimage) = entries.get(&recid) {
                return Ok(preimage.clone());
            }
        }
        // not captured, so the record has not changed since the snapshot
        self.inner.get(recid)
    }

    fn update(&self, _recid: Recid, _payload: &[u8]) -> StoreResult<()> {
        Err(StoreError::ReadOnly)
    }

    fn compare_and_swap(&self, _recid: Recid, _expected: &[u8], _new: &[u8]) -> StoreResult<bool> {
        Err(StoreError::ReadOnly)
    }

    fn delete(&self, _recid: Recid) -> StoreResult<()> {
        Err(StoreError::ReadOnly)
    }

    fn commit(&self) -> StoreResult<()> {
        self.check_open()
    }

    fn rollback(&self) -> StoreResult<()> {
        self.check_open()
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.registry.overlays.write().remove(&self.id);
        Ok(())
    }
}

impl Drop for SnapshotView {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
