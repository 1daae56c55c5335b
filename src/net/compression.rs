//! LZ4 packet compression
//!
//! Every payload is compressed before it reaches the engine and decompressed
//! before it reaches subscribers. The uncompressed size is prepended (4 bytes
//! LE) so the receiver can reject oversized packets before allocating.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::net::channel::MAX_PACKET_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    #[error("Compressed packet too short: {0} bytes")]
    Truncated(usize),
    #[error("Decompressed size {0} exceeds limit {1}")]
    TooLarge(usize, usize),
    #[error("LZ4 decompression failed: {0}")]
    Corrupt(String),
}

/// Compress a payload
pub fn compress(data: &[u8]) -> Vec<u8> {
    compress_prepend_size(data)
}

/// Upper bound of [`compress`] output for `size` input bytes
pub fn max_compressed_size(size: usize) -> usize {
    lz4_flex::block::get_maximum_output_size(size) + 4
}

/// Decompress a packet produced by [`compress`], at most [`MAX_PACKET_SIZE`] bytes
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    decompress_with_limit(data, MAX_PACKET_SIZE)
}

pub fn decompress_with_limit(data: &[u8], limit: usize) -> Result<Vec<u8>, CompressionError> {
    let Some(prefix) = data.get(..4) else {
        return Err(CompressionError::Truncated(data.len()));
    };
    let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if declared > limit {
        return Err(CompressionError::TooLarge(declared, limit));
    }
    let out = decompress_size_prepended(data).map_err(|e| CompressionError::Corrupt(e.to_string()))?;
    if out.len() != declared {
        return Err(CompressionError::Corrupt(format!(
            "decoded {} bytes, header declared {}",
            out.len(),
            declared
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 7) as u8).collect();
        let packed = compress(&data);
        assert!(packed.len() < data.len());
        assert!(packed.len() <= max_compressed_size(data.len()));
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_empty_payload() {
        let packed = compress(&[]);
        assert_eq!(decompress(&packed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_truncated() {
        assert_eq!(decompress(&[1, 2]), Err(CompressionError::Truncated(2)));
    }

    #[test]
    fn test_declared_size_over_limit() {
        let packed = compress(&vec![0u8; MAX_PACKET_SIZE + 1]);
        assert!(matches!(decompress(&packed), Err(CompressionError::TooLarge(_, _))));
    }

    #[test]
    fn test_short_decode_rejected() {
        assert!(matches!(decompress(&[9, 0, 0, 0, 1]), Err(CompressionError::Corrupt(_))));
        assert!(matches!(decompress(&[3, 0, 0, 0]), Err(CompressionError::Corrupt(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        let mut packed = compress(b"hello hello hello hello");
        let last = packed.len() - 1;
        packed.truncate(last);
        assert!(matches!(decompress(&packed), Err(CompressionError::Corrupt(_))));
    }
}
