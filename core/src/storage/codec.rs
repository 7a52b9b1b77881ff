//! Fixed-width integer encoding
//!
//! All on-disk integers are 8 bytes, big-endian.

use crate::error::{DbError, DbResult};
use bytes::{Buf, BufMut};

/// Encoded width of a 64-bit integer
pub const U64_LEN: usize = 8;

/// Encode an unsigned 64-bit integer
pub fn encode_u64(value: u64) -> [u8; U64_LEN] {
    let mut out = [0u8; U64_LEN];
    (&mut out[..]).put_u64(value);
    out
}

/// Decode an unsigned 64-bit integer from the first 8 bytes of `buf`
pub fn decode_u64(mut buf: &[u8]) -> DbResult<u64> {
    if buf.remaining() < U64_LEN {
        return Err(DbError::InsufficientBytes {
            expected: U64_LEN,
            actual: buf.remaining(),
        });
    }
    Ok(buf.get_u64())
}

/// Encode a signed 64-bit integer
pub fn encode_i64(value: i64) -> [u8; U64_LEN] {
    let mut out = [0u8; U64_LEN];
    (&mut out[..]).put_i64(value);
    out
}

/// Decode a signed 64-bit integer from the first 8 bytes of `buf`
pub fn decode_i64(mut buf: &[u8]) -> DbResult<i64> {
    if buf.remaining() < U64_LEN {
        return Err(DbError::InsufficientBytes {
            expected: U64_LEN,
            actual: buf.remaining(),
        });
    }
    Ok(buf.get_i64())
}
