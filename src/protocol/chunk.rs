//! Streaming chunk body codec
//!
//! Selected by the chunk-stream option bit: the body becomes a sequence of
//! u16-length-prefixed frames, terminated by a zero-length frame. Masking,
//! padding and length authentication are negotiated via the option bitmask
//! and layered on top of this framing by the cipher suite in use.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Largest payload one frame can carry
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// Append one data frame to `buf`. Payload must fit in a single frame.
pub fn encode_chunk(payload: &[u8], buf: &mut BytesMut) -> Result<(), CodecError> {
    if payload.is_empty() || payload.len() > MAX_CHUNK_SIZE {
        return Err(CodecError::Malformed("invalid chunk size"));
    }
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(())
}

/// Append the end-of-body marker
pub fn encode_chunk_end(buf: &mut BytesMut) {
    buf.put_u16(0);
}

/// Decode one frame from the front of `buf`, consuming it.
///
/// `Ok(Some(payload))` for a data frame, `Ok(Some(empty))` for the
/// terminator, `Ok(None)` when the buffer does not yet hold a full frame.
pub fn decode_chunk(buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return Ok(None);
    }
    buf.advance(2);
    Ok(Some(buf.split_to(len).freeze()))
}
