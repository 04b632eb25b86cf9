//! The binary delta codec seam.
//!
//! The diff and apply engines only see [`DeltaCodec`]: `delta(base, target)`
//! produces opaque bytes, `reconstruct(base, delta)` turns them back into the
//! target. [`BlockCodec`] is the shipped implementation: an rsync-like block
//! matcher whose chunk list is bincode-encoded and zstd-compressed.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::{binary_diff, binary_patch, util};

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;
/// Largest decompressed chunk list `reconstruct` will accept.
pub const MAX_DELTA_LEN: u64 = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode delta: {0}")]
    Encode(String),

    #[error("malformed delta: {0}")]
    Malformed(String),

    #[error("copy of {length} bytes at offset {offset} exceeds base length {base_len}")]
    CopyOutOfRange {
        offset: u64,
        length: u64,
        base_len: u64,
    },
}

/// Produces and consumes deltas between two byte blobs.
pub trait DeltaCodec: Send + Sync {
    fn delta(&self, base: &[u8], target: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn reconstruct(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
pub struct BlockCodec {
    pub block_size: usize,
    pub compression_level: i32,
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl BlockCodec {
    pub fn new(block_size: usize, compression_level: i32) -> Self {
        Self {
            block_size: block_size.max(1),
            compression_level,
        }
    }
}

fn chunk_options() -> impl Options {
    bincode::options().with_fixint_encoding()
}

impl DeltaCodec for BlockCodec {
    fn delta(&self, base: &[u8], target: &[u8]) -> Result<Vec<u8>, CodecError> {
        let chunks = binary_diff::compute_diff(base, target, self.block_size);
        let encoded = chunk_options()
            .serialize(&chunks)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        zstd::bulk::compress(&encoded, self.compression_level)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn reconstruct(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>, CodecError> {
        let encoded = util::zstd_decode_bounded(delta, MAX_DELTA_LEN)
            .map_err(|e| CodecError::Malformed(format!("zstd: {e}")))?;
        let chunks: Vec<DiffChunk> = chunk_options()
            .with_limit(encoded.len() as u64)
            .deserialize(&encoded)
            .map_err(|e| CodecError::Malformed(format!("chunk list: {e}")))?;
        binary_patch::apply_diff(base, &chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_reconstructs_target() {
        let codec = BlockCodec::new(64, 3);
        let base: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut target = base.clone();
        target.splice(1000..1000, b"inserted".iter().copied());
        target.truncate(3000);

        let delta = codec.delta(&base, &target).unwrap();
        assert!(delta.len() < target.len());
        assert_eq!(codec.reconstruct(&base, &delta).unwrap(), target);
    }

    #[test]
    fn test_zero_byte_inputs() {
        let codec = BlockCodec::default();
        let delta = codec.delta(b"", b"").unwrap();
        assert_eq!(codec.reconstruct(b"", &delta).unwrap(), b"");
        let delta = codec.delta(b"something", b"").unwrap();
        assert_eq!(codec.reconstruct(b"something", &delta).unwrap(), b"");
    }

    #[test]
    fn test_garbage_delta_is_codec_error() {
        let codec = BlockCodec::default();
        let err = codec.reconstruct(b"base", b"definitely not zstd").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_delta_against_shorter_base_is_rejected() {
        let codec = BlockCodec::new(4, 3);
        let base = b"0123456789abcdef".to_vec();
        let target = b"0123456789abcdefXYZ".to_vec();
        let delta = codec.delta(&base, &target).unwrap();
        let err = codec.reconstruct(b"0123", &delta).unwrap_err();
        assert!(matches!(err, CodecError::CopyOutOfRange { .. }));
    }
}
