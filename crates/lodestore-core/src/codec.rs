//! Value codecs and the byte cursor they decode from
//!
//! Engine payloads are raw bytes; callers describe typed values through a
//! `Codec`. Codecs used inside composite structures must be self-delimiting,
//! either through a fixed width or an internal length prefix, because
//! composites concatenate encoded values with no framing of their own.

use crate::error::{StoreError, StoreResult};

/// Forward-only cursor over a byte slice
pub struct ByteReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a reader positioned at the start of `input`
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Current read position from the start of the input
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read exactly `len` bytes, advancing past them
    pub fn read_bytes(&mut self, len: usize) -> StoreResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(StoreError::Corrupted {
                context: "byte reader",
                detail: format!("need {} bytes, {} remaining", len, self.remaining()),
            });
        }
        let out = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> StoreResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Read a little-endian u32
    pub fn read_u32_le(&mut self) -> StoreResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian u64
    pub fn read_u64_le(&mut self) -> StoreResult<u64> {
        let b = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
}

/// Append `value` as a base-128 varint: low 7 bits first, high bit set on
/// every byte except the last. Encodings are 1 to 10 bytes.
pub fn pack_u64(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a base-128 varint. Rejects encodings that overflow u64 or run
/// past the 10-byte maximum.
pub fn unpack_u64(input: &mut ByteReader<'_>) -> StoreResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = input.read_u8()?;
        let chunk = u64::from(byte & 0x7f);
        if shift >= 64 || (shift == 63 && chunk > 1) {
            return Err(StoreError::Corrupted {
                context: "varint",
                detail: "encoding overflows u64".into(),
            });
        }
        value |= chunk << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Decode a varint length prefix, bounded to the platform address space
fn read_len(input: &mut ByteReader<'_>, context: &'static str) -> StoreResult<usize> {
    let len = unpack_u64(input)?;
    usize::try_from(len).map_err(|_| StoreError::Corrupted {
        context,
        detail: format!("length prefix {} exceeds address space", len),
    })
}

/// Typed value codec over engine byte payloads
///
/// `fixed_width` returning `Some(n)` promises every encoding is exactly `n`
/// bytes. `is_trusted` promises `decode` consumes exactly the bytes `encode`
/// produced and never reads past them; callers may then skip the
/// trailing-byte check after decoding a standalone payload.
pub trait Codec<T>: Send + Sync {
    /// Append the encoded form of `value` to `out`
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> StoreResult<()>;

    /// Decode one value, advancing the reader past it
    fn decode(&self, input: &mut ByteReader<'_>) -> StoreResult<T>;

    /// Exact encoded size, when every value has the same one
    fn fixed_width(&self) -> Option<usize> {
        None
    }

    /// True when decode consumes exactly what encode produced
    fn is_trusted(&self) -> bool {
        false
    }
}

/// Raw byte payloads with a varint length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>, out: &mut Vec<u8>) -> StoreResult<()> {
        pack_u64(value.len() as u64, out);
        out.extend_from_slice(value);
        Ok(())
    }

    fn decode(&self, input: &mut ByteReader<'_>) -> StoreResult<Vec<u8>> {
        let len = read_len(input, "bytes codec")?;
        Ok(input.read_bytes(len)?.to_vec())
    }

    fn is_trusted(&self) -> bool {
        true
    }
}

/// UTF-8 strings with a varint length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String, out: &mut Vec<u8>) -> StoreResult<()> {
        pack_u64(value.len() as u64, out);
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn decode(&self, input: &mut ByteReader<'_>) -> StoreResult<String> {
        let len = read_len(input, "utf8 codec")?;
        let bytes = input.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| StoreError::Corrupted {
            context: "utf8 codec",
            detail: "payload is not valid UTF-8".into(),
        })
    }
}

/// Fixed-width u64, 8 bytes little-endian
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl Codec<u64> for U64Codec {
    fn encode(&self, value: &u64, out: &mut Vec<u8>) -> StoreResult<()> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn decode(&self, input: &mut ByteReader<'_>) -> StoreResult<u64> {
        input.read_u64_le()
    }

    fn fixed_width(&self) -> Option<usize> {
        Some(8)
    }

    fn is_trusted(&self) -> bool {
        true
    }
}

/// Packed u64 as a base-128 varint
#[derive(Debug, Clone, Copy, Default)]
pub struct VarintCodec;

impl Codec<u64> for VarintCodec {
    fn encode(&self, value: &u64, out: &mut Vec<u8>) -> StoreResult<()> {
        pack_u64(*value, out);
        Ok(())
    }

    fn decode(&self, input: &mut ByteReader<'_>) -> StoreResult<u64> {
        unpack_u64(input)
    }

    fn is_trusted(&self) -> bool {
        true
    }
}
