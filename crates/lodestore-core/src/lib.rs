//! LodeStore Core — Layered record storage engine
//!
//! An embedded record store built as a stack of engine layers, each
//! wrapping the next behind the same [`Engine`] trait:
//!
//! - **Record store**: slot allocation, free-space reuse, checksummed slots
//! - **Write-ahead log**: transactional commits with crash replay
//! - **Write-behind cache**: asynchronous flush on a background thread
//! - **Snapshots**: point-in-time read views via copy-on-first-write
//!
//! Layers compose through `Arc<dyn Engine>`, so a caller stacks exactly
//! what the workload needs: a bare [`RecordStore`] for scratch data, the
//! write-ahead log for durability, the write-behind cache for write
//! latency, snapshots for consistent reads. Typed access sits on top of
//! any stack through [`Codec`] and [`EngineExt`].
//!
//! Records are addressed by recid, an opaque handle the engine assigns at
//! allocation and never reuses. Recid 0 is reserved as the nil sentinel
//! and is never allocated, which lets callers store "no record" inline.

pub mod codec;
pub mod config;
pub mod durability;
pub mod engine;
pub mod error;
pub mod format;
pub mod snapshot;
pub mod store;
pub mod volume;
pub mod wal;
pub mod writebehind;

// Re-export key types for convenience
pub use codec::{ByteReader, BytesCodec, Codec, U64Codec, Utf8Codec, VarintCodec};
pub use config::Config;
pub use engine::{Engine, EngineExt, Recid, NIL_RECID};
pub use error::{StoreError, StoreResult};
pub use snapshot::{SnapshotEngine, SnapshotView};
pub use store::RecordStore;
pub use volume::{FileVolume, MemVolume, Volume};
pub use wal::WalStore;
pub use writebehind::WriteBehind;
