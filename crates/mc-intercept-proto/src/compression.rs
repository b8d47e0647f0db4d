//! zlib for compressed frame bodies.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::ProtoError;

/// Deflate `data` at `level` (0-9).
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, ProtoError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| ProtoError::CompressError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtoError::CompressError(e.to_string()))
}

/// Inflate `data`, refusing to produce more than `limit` bytes.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, ProtoError> {
    let mut output = Vec::new();
    ZlibDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut output)
        .map_err(|e| ProtoError::DecompressError(e.to_string()))?;
    if output.len() > limit {
        return Err(ProtoError::DecompressError(format!(
            "inflated past limit {limit}"
        )));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_roundtrip() {
        let data = b"intercepted payload intercepted payload intercepted payload";
        let compressed = compress(data, 6).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed, 1024).unwrap(), data);
    }

    #[test]
    fn inflation_limit_enforced() {
        let compressed = compress(&[0u8; 4096], 6).unwrap();
        assert!(decompress(&compressed, 1024).is_err());
        assert_eq!(decompress(&compressed, 4096).unwrap().len(), 4096);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decompress(&[0x05, 0x68, 0x69], 1024),
            Err(ProtoError::DecompressError(_))
        ));
    }
}
