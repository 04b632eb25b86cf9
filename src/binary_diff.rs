use std::collections::HashMap;

use crate::codec::DiffChunk;
use crate::rolling_hash::Adler32Window;

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: usize,
    len: usize,
}

/// Express `new` as copies out of `old` plus literal inserts.
///
/// Full `block_size` blocks of `old` are indexed by Adler-32 and confirmed
/// with BLAKE3 before a copy is emitted. Copies of consecutive blocks merge.
pub fn compute_diff(old: &[u8], new: &[u8], block_size: usize) -> Vec<DiffChunk> {
    if new.is_empty() {
        return vec![];
    }
    if old.is_empty() || new.len() < block_size {
        return vec![DiffChunk::Insert { data: new.to_vec() }];
    }

    let signatures = build_signatures(old, block_size);
    let mut index: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        index.entry(sig.weak).or_default().push(idx);
    }

    let mut out = ChunkBuilder::default();
    let mut window = Adler32Window::over(&new[..block_size]);
    let mut pos = 0usize;

    while pos + block_size <= new.len() {
        let block = &new[pos..pos + block_size];
        match find_match(window.digest(), block, &index, &signatures) {
            Some(sig) => {
                out.copy(sig.offset as u64, sig.len as u64);
                pos += sig.len;
                if pos + block_size <= new.len() {
                    window = Adler32Window::over(&new[pos..pos + block_size]);
                }
            }
            None => {
                out.literal(new[pos]);
                if pos + block_size < new.len() {
                    window.roll(new[pos], new[pos + block_size]);
                }
                pos += 1;
            }
        }
    }

    // Tail shorter than a full window
    for &byte in &new[pos..] {
        out.literal(byte);
    }
    out.finish()
}

fn build_signatures(data: &[u8], block_size: usize) -> Vec<BlockSignature> {
    data.chunks(block_size)
        .enumerate()
        // A short trailing block can never equal a full-size window.
        .filter(|(_, block)| block.len() == block_size)
        .map(|(i, block)| BlockSignature {
            weak: Adler32Window::over(block).digest(),
            strong: blake3::hash(block),
            offset: i * block_size,
            len: block.len(),
        })
        .collect()
}

fn find_match<'a>(
    weak: u32,
    block: &[u8],
    index: &HashMap<u32, Vec<usize>>,
    signatures: &'a [BlockSignature],
) -> Option<&'a BlockSignature> {
    let candidates = index.get(&weak)?;
    let strong = blake3::hash(block);
    candidates
        .iter()
        .map(|&idx| &signatures[idx])
        .find(|sig| sig.strong == strong)
}

#[derive(Default)]
struct ChunkBuilder {
    chunks: Vec<DiffChunk>,
    pending: Vec<u8>,
}

impl ChunkBuilder {
    fn literal(&mut self, byte: u8) {
        self.pending.push(byte);
    }

    fn copy(&mut self, offset: u64, length: u64) {
        self.flush_literals();
        if let Some(DiffChunk::Copy {
            offset: prev_offset,
            length: prev_len,
        }) = self.chunks.last_mut()
        {
            if *prev_offset + *prev_len == offset {
                *prev_len += length;
                return;
            }
        }
        self.chunks.push(DiffChunk::Copy { offset, length });
    }

    fn flush_literals(&mut self) {
        if !self.pending.is_empty() {
            self.chunks.push(DiffChunk::Insert {
                data: std::mem::take(&mut self.pending),
            });
        }
    }

    fn finish(mut self) -> Vec<DiffChunk> {
        self.flush_literals();
        self.chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_patch::apply_diff;

    const BLOCK: usize = 4096;

    fn roundtrip(old: &[u8], new: &[u8]) -> Vec<DiffChunk> {
        let chunks = compute_diff(old, new, BLOCK);
        assert_eq!(apply_diff(old, &chunks).unwrap(), new);
        chunks
    }

    #[test]
    fn test_identical_data_is_one_copy() {
        let data: Vec<u8> = (0..BLOCK * 3).map(|i| (i % 251) as u8).collect();
        let chunks = roundtrip(&data, &data);
        assert_eq!(
            chunks,
            vec![DiffChunk::Copy {
                offset: 0,
                length: (BLOCK * 3) as u64
            }]
        );
    }

    #[test]
    fn test_completely_different() {
        let old = vec![0u8; BLOCK * 2];
        let new = vec![1u8; BLOCK * 2];
        let chunks = roundtrip(&old, &new);
        assert!(chunks.iter().all(|c| matches!(c, DiffChunk::Insert { .. })));
    }

    #[test]
    fn test_prefix_changed_keeps_tail_copies() {
        let old: Vec<u8> = (0..BLOCK * 4).map(|i| (i / 7 % 256) as u8).collect();
        let mut new = old.clone();
        for b in new[..BLOCK].iter_mut() {
            *b = 0xFF;
        }
        let chunks = roundtrip(&old, &new);
        let copied: u64 = chunks
            .iter()
            .map(|c| match c {
                DiffChunk::Copy { length, .. } => *length,
                DiffChunk::Insert { .. } => 0,
            })
            .sum();
        assert!(copied >= (BLOCK * 3) as u64, "unchanged blocks should be copied");
    }

    #[test]
    fn test_empty_sides() {
        roundtrip(&[], &[1u8; 100]);
        assert!(roundtrip(&[1u8; 100], &[]).is_empty());
    }

    #[test]
    fn test_small_files() {
        roundtrip(b"Hello, World!", b"Hello, Rust!");
    }

    #[test]
    fn test_insertion_in_middle() {
        let old: Vec<u8> = (0..BLOCK * 4).map(|i| (i % 256) as u8).collect();
        let mut new = old.clone();
        new.splice(BLOCK * 2..BLOCK * 2, vec![0xAA; 100]);
        roundtrip(&old, &new);
    }

    #[test]
    fn test_window_rolls_to_last_byte() {
        // Match only becomes visible once the window has rolled to the very end.
        let old: Vec<u8> = (0..64u8).collect();
        let mut new = vec![0xEE; 5];
        new.extend_from_slice(&old[32..64]);
        let chunks = compute_diff(&old, &new, 32);
        assert_eq!(apply_diff(&old, &chunks).unwrap(), new);
        assert!(chunks.contains(&DiffChunk::Copy { offset: 32, length: 32 }));
    }
}
