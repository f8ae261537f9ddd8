//! Engine capability shared by every storage layer
//!
//! Layers compose by wrapping: snapshot over write-behind over the log layer
//! over the record store. Callers hold the outermost layer as
//! `Arc<dyn Engine>` and stay oblivious to the stack below it. The byte-level
//! trait is object safe; the codec-typed flavor lives in `EngineExt`.

use crate::codec::{ByteReader, Codec};
use crate::error::{StoreError, StoreResult};

/// Stable identifier of one logical record
pub type Recid = u64;

/// Recid that is never allocated, usable as an inline "no record" marker
pub const NIL_RECID: Recid = 0;

/// Uniform storage capability implemented by every layer
pub trait Engine: Send + Sync {
    /// Store a new payload and return its recid
    fn allocate(&self, payload: &[u8]) -> StoreResult<Recid>;

    /// Read the payload for `recid`; `None` when never allocated or deleted
    fn get(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the payload for an existing `recid`
    fn update(&self, recid: Recid, payload: &[u8]) -> StoreResult<()>;

    /// Replace the payload iff the stored bytes equal `expected`.
    ///
    /// A `false` return is a retry signal consumed by optimistic loops
    /// above the engine, never an error.
    fn compare_and_swap(&self, recid: Recid, expected: &[u8], new: &[u8]) -> StoreResult<bool>;

    /// Remove `recid`; later gets return `None`
    fn delete(&self, recid: Recid) -> StoreResult<()>;

    /// Make all mutations since the last commit durable
    fn commit(&self) -> StoreResult<()>;

    /// Discard mutations since the last commit.
    ///
    /// Only layers with transaction buffering support this; others report
    /// an unsupported-operation error.
    fn rollback(&self) -> StoreResult<()>;

    /// Flush and shut down this layer and everything below it
    fn close(&self) -> StoreResult<()>;
}

/// Codec-typed convenience operations over any `Engine`
///
/// Untrusted codecs get a strict framing check: a payload that leaves
/// undecoded trailing bytes is reported as corruption rather than silently
/// accepted.
pub trait EngineExt: Engine {
    /// Encode `value` and store it as a new record
    fn put_value<T, C: Codec<T>>(&self, value: &T, codec: &C) -> StoreResult<Recid> {
        let mut buf = Vec::new();
        codec.encode(value, &mut buf)?;
        self.allocate(&buf)
    }

    /// Read and decode the record at `recid`
    fn get_value<T, C: Codec<T>>(&self, recid: Recid, codec: &C) -> StoreResult<Option<T>> {
        let payload = match self.get(recid)? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let mut reader = ByteReader::new(&payload);
        let value = codec.decode(&mut reader)?;
        if !codec.is_trusted() && reader.remaining() != 0 {
            return Err(StoreError::Corrupted {
                context: "record payload",
                detail: format!("{} undecoded trailing bytes", reader.remaining()),
            });
        }
        Ok(Some(value))
    }

    /// Encode `value` and replace the record at `recid`
    fn update_value<T, C: Codec<T>>(&self, recid: Recid, value: &T, codec: &C) -> StoreResult<()> {
        let mut buf = Vec::new();
        codec.encode(value, &mut buf)?;
        self.update(recid, &buf)
    }

    /// Typed compare-and-swap; equality is over the encoded bytes
    fn compare_and_swap_value<T, C: Codec<T>>(
        &self,
        recid: Recid,
        expected: &T,
        new: &T,
        codec: &C,
    ) -> StoreResult<bool> {
        let mut expected_buf = Vec::new();
        codec.encode(expected, &mut expected_buf)?;
        let mut new_buf = Vec::new();
        codec.encode(new, &mut new_buf)?;
        self.compare_and_swap(recid, &expected_buf, &new_buf)
    }
}

impl<E: Engine + ?Sized> EngineExt for E {}
