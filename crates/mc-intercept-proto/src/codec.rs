//! Encode/decode traits and the length-prefixed primitives of the wire format.
//!
//! Strings and byte arrays carry a `VarInt` byte length. Negative lengths are malformed.

use bytes::{Buf, BufMut};

use crate::error::ProtoError;
use crate::types::VarInt;

/// Longest string the protocol allows, in UTF-16 code units.
pub const MAX_STRING_CHARS: usize = 32767;

/// Encode a value onto a buffer.
pub trait ProtoEncode {
    fn proto_encode(&self, buf: &mut impl BufMut);
}

/// Decode a value from a buffer.
pub trait ProtoDecode: Sized {
    fn proto_decode(buf: &mut impl Buf) -> Result<Self, ProtoError>;
}

/// Fail with `BufferTooShort` unless `needed` bytes remain.
pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), ProtoError> {
    if buf.remaining() < needed {
        return Err(ProtoError::BufferTooShort {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Write a `VarInt` length prefix.
pub fn write_len(buf: &mut impl BufMut, len: usize) -> Result<(), ProtoError> {
    let len = i32::try_from(len)
        .map_err(|_| ProtoError::InvalidData(format!("length {len} does not fit a VarInt")))?;
    VarInt(len).proto_encode(buf);
    Ok(())
}

/// Read a `VarInt` length prefix.
pub fn read_len(buf: &mut impl Buf) -> Result<usize, ProtoError> {
    let len = VarInt::proto_decode(buf)?.0;
    usize::try_from(len).map_err(|_| ProtoError::InvalidData(format!("negative length {len}")))
}

fn check_string(s: &str) -> Result<(), ProtoError> {
    let chars = s.encode_utf16().count();
    if chars > MAX_STRING_CHARS {
        return Err(ProtoError::InvalidData(format!(
            "string of {chars} chars exceeds {MAX_STRING_CHARS}"
        )));
    }
    Ok(())
}

/// Write a string as its UTF-8 byte length followed by the bytes.
pub fn write_string(buf: &mut impl BufMut, s: &str) -> Result<(), ProtoError> {
    check_string(s)?;
    write_len(buf, s.len())?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Read a string, enforcing the protocol's length cap.
pub fn read_string(buf: &mut impl Buf) -> Result<String, ProtoError> {
    let len = read_len(buf)?;
    // A UTF-16 unit never takes more than three UTF-8 bytes.
    if len > MAX_STRING_CHARS * 3 {
        return Err(ProtoError::InvalidData(format!("string of {len} bytes is too long")));
    }
    ensure_remaining(buf, len)?;
    let s = String::from_utf8(buf.copy_to_bytes(len).to_vec()).map_err(|_| ProtoError::InvalidUtf8)?;
    check_string(&s)?;
    Ok(s)
}

/// Write a length-prefixed byte array.
pub fn write_byte_array(buf: &mut impl BufMut, data: &[u8]) -> Result<(), ProtoError> {
    write_len(buf, data.len())?;
    buf.put_slice(data);
    Ok(())
}

/// Read a length-prefixed byte array.
pub fn read_byte_array(buf: &mut impl Buf) -> Result<Vec<u8>, ProtoError> {
    let len = read_len(buf)?;
    ensure_remaining(buf, len)?;
    Ok(buf.copy_to_bytes(len).to_vec())
}
