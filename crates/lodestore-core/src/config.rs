//! Configuration management for LodeStore
//!
//! Provides durability presets for the common deployment modes
//! and a validation pass over custom configurations.

use std::time::Duration;

/// LodeStore configuration with durability presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum record payload size in bytes
    pub max_record_size: usize,
    /// Maximum buffered transaction entries before commit is required
    pub max_uncommitted: usize,
    /// Maximum pending entries in the write-behind queue
    pub write_queue_capacity: usize,
    /// Background write-behind flush cadence
    pub flush_cadence: Duration,
    /// Recids preallocated per batch for the write-behind layer
    pub recid_pool_batch: usize,
    /// Call fsync on the backing volume at every commit
    pub sync_on_commit: bool,
    /// Remove backing files when the engine is closed
    pub delete_files_on_close: bool,
}

impl Config {
    /// Durable mode: every commit reaches disk before returning
    pub fn durable() -> Self {
        Self {
            max_record_size: 32 * 1024 * 1024,
            max_uncommitted: 64 * 1024,
            write_queue_capacity: 16 * 1024,
            flush_cadence: Duration::from_millis(100),
            recid_pool_batch: 32,
            sync_on_commit: true,
            delete_files_on_close: false,
        }
    }

    /// Ephemeral mode: scratch data, no fsync, files removed on close
    pub fn ephemeral() -> Self {
        Self {
            max_record_size: 32 * 1024 * 1024,
            max_uncommitted: 64 * 1024,
            write_queue_capacity: 16 * 1024,
            flush_cadence: Duration::from_millis(50),
            recid_pool_batch: 32,
            sync_on_commit: false,
            delete_files_on_close: true,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_record_size == 0 || self.max_record_size > 128 * 1024 * 1024 {
            return Err("max_record_size must be in [1, 128MB]".into());
        }
        if self.max_uncommitted == 0 {
            return Err("max_uncommitted must be > 0".into());
        }
        if self.write_queue_capacity == 0 {
            return Err("write_queue_capacity must be > 0".into());
        }
        if self.flush_cadence.as_millis() == 0 {
            return Err("flush_cadence must be > 0".into());
        }
        if self.recid_pool_batch == 0 || self.recid_pool_batch > 4096 {
            return Err("recid_pool_batch must be in [1, 4096]".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::durable() }
}
