//! Stream framing.
//!
//! Every frame on the wire is `VarInt(length) + body`. Before compression is negotiated the body
//! is the raw packet (`VarInt(packet_id) + fields`). Afterwards the body is
//! `VarInt(data_length) + data`: a `data_length` of zero marks a raw packet, anything else is the
//! inflated size of the zlib stream that follows.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{ProtoDecode, ProtoEncode};
use crate::compression::{compress, decompress};
use crate::error::ProtoError;
use crate::types::{VarInt, VarIntError, VarUInt32};

/// Per-connection frame codec settings.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// zlib level (0-9) for outgoing packets above the threshold.
    pub compression_level: u32,
    /// Packets smaller than this are sent uncompressed.
    pub compression_threshold: usize,
    /// Whether compression has been negotiated on this connection.
    pub compression_enabled: bool,
    /// Largest frame body or inflated packet accepted.
    pub max_frame_len: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            compression_threshold: 256,
            compression_enabled: false,
            max_frame_len: 2 * 1024 * 1024,
        }
    }
}

impl FrameConfig {
    /// Switch compression on with the threshold the server announced.
    /// A negative threshold disables compression.
    pub fn negotiate(&mut self, threshold: i32) {
        self.compression_enabled = threshold >= 0;
        self.compression_threshold = threshold.max(0) as usize;
    }
}

/// Wrap one encoded packet into a length-prefixed frame.
pub fn encode_frame(packet: &[u8], config: &FrameConfig) -> Result<Bytes, ProtoError> {
    let body = if config.compression_enabled {
        let mut body = BytesMut::with_capacity(VarInt::MAX_BYTES + packet.len());
        if packet.len() < config.compression_threshold {
            VarInt(0).proto_encode(&mut body);
            body.put_slice(packet);
        } else {
            VarInt(packet.len() as i32).proto_encode(&mut body);
            body.put_slice(&compress(packet, config.compression_level)?);
        }
        body.freeze()
    } else {
        Bytes::copy_from_slice(packet)
    };

    let mut frame = BytesMut::with_capacity(VarUInt32::MAX_BYTES + body.len());
    VarUInt32(body.len() as u32).proto_encode(&mut frame);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Recover the packet bytes from a frame body (length prefix already removed).
pub fn decode_frame(body: Bytes, config: &FrameConfig) -> Result<Bytes, ProtoError> {
    if !config.compression_enabled {
        return Ok(body);
    }
    let mut peek = &body[..];
    let data_length = VarInt::proto_decode(&mut peek)?.0;
    let offset = body.len() - peek.len();
    let expected = match usize::try_from(data_length) {
        Ok(0) => return Ok(body.slice(offset..)),
        Ok(len) if len <= config.max_frame_len => len,
        Ok(len) => {
            return Err(ProtoError::InvalidData(format!(
                "declared packet of {len} bytes exceeds limit {}",
                config.max_frame_len
            )))
        }
        Err(_) => {
            return Err(ProtoError::InvalidData(format!(
                "negative data length {data_length}"
            )))
        }
    };
    let inflated = decompress(&body[offset..], expected)?;
    if inflated.len() != expected {
        return Err(ProtoError::DecompressError(format!(
            "inflated to {} bytes, header declared {expected}",
            inflated.len()
        )));
    }
    Ok(Bytes::from(inflated))
}

/// Take the next complete frame body off the front of a read buffer.
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed in that case.
pub fn split_frame(buf: &mut BytesMut, max_frame_len: usize) -> Result<Option<Bytes>, ProtoError> {
    let mut peek = &buf[..];
    let len = match VarUInt32::proto_decode(&mut peek) {
        Ok(len) => len,
        Err(ProtoError::VarInt(VarIntError::BufferTooShort)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let body_len = len.0 as usize;
    if body_len > max_frame_len {
        return Err(ProtoError::InvalidData(format!(
            "frame of {body_len} bytes exceeds limit {max_frame_len}"
        )));
    }
    if peek.remaining() < body_len {
        return Ok(None);
    }
    buf.advance(len.encoded_len());
    Ok(Some(buf.split_to(body_len).freeze()))
}
