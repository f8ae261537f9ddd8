//! Byte volume abstraction over memory and file backing
//!
//! Every storage layer addresses bytes through the `Volume` trait; nothing
//! above this module touches files directly. File-backed volumes route
//! `sync` through the platform durable sync shim so commit durability holds
//! across power loss, not just process death.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::durability::{durable_sync, sync_dir};
use crate::error::{StoreError, StoreResult};

/// Addressable byte storage, memory or file backed
pub trait Volume: Send + Sync {
    /// Fill `buf` from `offset`; the full range must exist
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()>;

    /// Write `data` at `offset`, growing the volume if the range ends past it
    fn write_bytes(&self, offset: u64, data: &[u8]) -> StoreResult<()>;

    /// Current length in bytes
    fn len(&self) -> u64;

    /// True when the volume holds no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow the volume to at least `len` bytes
    fn ensure_capacity(&self, len: u64) -> StoreResult<()>;

    /// Shrink the volume to exactly `len` bytes
    fn truncate(&self, len: u64) -> StoreResult<()>;

    /// Durably sync contents to the backing medium
    fn sync(&self) -> StoreResult<()>;

    /// Flush and release the backing handle; idempotent
    fn close(&self) -> StoreResult<()>;

    /// Remove the backing file, closing first if needed; no-op without one
    fn delete_backing(&self) -> StoreResult<()>;
}

fn read_past_end(offset: u64, want: usize, len: u64) -> StoreError {
    StoreError::Io {
        path: None,
        kind: std::io::ErrorKind::UnexpectedEof,
        message: format!("read of {} bytes at offset {} past end at {}", want, offset, len),
    }
}

/// Growable in-memory volume, used for ephemeral stores and tests
pub struct MemVolume {
    data: RwLock<Vec<u8>>,
    closed: AtomicBool,
}

impl MemVolume {
    /// Create an empty in-memory volume
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl Volume for MemVolume {
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.check_open()?;
        let data = self.data.read();
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&e| e <= data.len() as u64)
            .ok_or_else(|| read_past_end(offset, buf.len(), data.len() as u64))?;
        buf.copy_from_slice(&data[offset as usize..end as usize]);
        Ok(())
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        let mut store = self.data.write();
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| StoreError::Corrupted {
            context: "memory volume",
            detail: format!("write range at offset {} overflows", offset),
        })?;
        if end > store.len() as u64 {
            store.resize(end as usize, 0);
        }
        store[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn ensure_capacity(&self, len: u64) -> StoreResult<()> {
        self.check_open()?;
        let mut store = self.data.write();
        if len > store.len() as u64 {
            store.resize(len as usize, 0);
        }
        Ok(())
    }

    fn truncate(&self, len: u64) -> StoreResult<()> {
        self.check_open()?;
        let mut store = self.data.write();
        if len < store.len() as u64 {
            store.truncate(len as usize);
        }
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        self.check_open()
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn delete_backing(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        self.data.write().clear();
        Ok(())
    }
}

/// File-backed volume with durable sync
pub struct FileVolume {
    file: Mutex<Option<File>>,
    path: PathBuf,
    len: AtomicU64,
}

impl FileVolume {
    /// Open or create the file at `path`, creating parent directories
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                    path: Some(parent.to_path_buf()),
                    kind: e.kind(),
                    message: format!("Failed to create volume directory: {}", e),
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::Io {
                path: Some(path.to_path_buf()),
                kind: e.kind(),
                message: format!("Failed to open volume file: {}", e),
            })?;

        let len = file
            .metadata()
            .map_err(|e| StoreError::Io {
                path: Some(path.to_path_buf()),
                kind: e.kind(),
                message: format!("Failed to stat volume file: {}", e),
            })?
            .len();

        Ok(Self {
            file: Mutex::new(Some(file)),
            path: path.to_path_buf(),
            len: AtomicU64::new(len),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, e: &std::io::Error, what: &str) -> StoreError {
        StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("{}: {}", what, e),
        }
    }
}

impl Volume for FileVolume {
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_error(&e, "Volume seek failed"))?;
        file.read_exact(buf)
            .map_err(|e| self.io_error(&e, "Volume read failed"))
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> StoreResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_error(&e, "Volume seek failed"))?;
        file.write_all(data)
            .map_err(|e| self.io_error(&e, "Volume write failed"))?;

        // len updates happen under the file lock; fetch_max keeps the mirror
        // monotone against the concurrent reads in len()
        let end = offset + data.len() as u64;
        self.len.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn ensure_capacity(&self, len: u64) -> StoreResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StoreError::Closed)?;
        if len > self.len.load(Ordering::Acquire) {
            file.set_len(len)
                .map_err(|e| self.io_error(&e, "Volume grow failed"))?;
            self.len.fetch_max(len, Ordering::AcqRel);
        }
        Ok(())
    }

    fn truncate(&self, len: u64) -> StoreResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StoreError::Closed)?;
        if len < self.len.load(Ordering::Acquire) {
            file.set_len(len)
                .map_err(|e| self.io_error(&e, "Volume truncate failed"))?;
            self.len.store(len, Ordering::Release);
        }
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StoreError::Closed)?;
        durable_sync(file).map_err(|e| self.io_error(&e, "Volume durable_sync failed"))
    }

    fn close(&self) -> StoreResult<()> {
        let mut guard = self.file.lock();
        if let Some(file) = guard.take() {
            durable_sync(&file).map_err(|e| self.io_error(&e, "Volume sync on close failed"))?;
        }
        Ok(())
    }

    fn delete_backing(&self) -> StoreResult<()> {
        // Drop the handle without a final sync; the file is going away
        self.file.lock().take();

        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.io_error(&e, "Volume delete failed")),
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                sync_dir(parent).map_err(|e| self.io_error(&e, "Directory sync after delete failed"))?;
            }
        }
        Ok(())
    }
}
