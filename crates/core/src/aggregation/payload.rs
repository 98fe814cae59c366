//! Aggregate payload codec.
//!
//! Every tier encodes its value as exactly eight bytes in network byte order.
//! Decoding rejects any other length instead of guessing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::errors::PayloadError;

/// Width of an encoded aggregate in bytes.
pub const PAYLOAD_LEN: usize = std::mem::size_of::<u64>();

pub fn encode_value(value: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(PAYLOAD_LEN);
    buf.put_u64(value);
    buf.freeze()
}

pub fn decode_value(mut payload: &[u8]) -> Result<u64, PayloadError> {
    if payload.len() != PAYLOAD_LEN {
        return Err(PayloadError::InvalidLength {
            expected: PAYLOAD_LEN,
            actual: payload.len(),
        });
    }
    Ok(payload.get_u64())
}
