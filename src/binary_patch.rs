use crate::codec::{CodecError, DiffChunk};

/// Reconstruct the new data from the old data and a sequence of diff chunks.
///
/// Every `Copy` is bounds-checked against `old`: a delta built against a
/// different base fails here instead of panicking or reading garbage.
pub fn apply_diff(old: &[u8], chunks: &[DiffChunk]) -> Result<Vec<u8>, CodecError> {
    let mut estimated: u64 = 0;
    for chunk in chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let end = offset.checked_add(*length);
                if end.map_or(true, |end| end > old.len() as u64) {
                    return Err(CodecError::CopyOutOfRange {
                        offset: *offset,
                        length: *length,
                        base_len: old.len() as u64,
                    });
                }
                estimated += length;
            }
            DiffChunk::Insert { data } => estimated += data.len() as u64,
        }
    }

    let mut result = Vec::with_capacity(estimated as usize);
    for chunk in chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let start = *offset as usize;
                result.extend_from_slice(&old[start..start + *length as usize]);
            }
            DiffChunk::Insert { data } => result.extend_from_slice(data),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mixed() {
        let old = b"AAAA_BBBB_CCCC";
        let chunks = vec![
            DiffChunk::Copy { offset: 0, length: 5 },
            DiffChunk::Insert {
                data: b"XXXX_".to_vec(),
            },
            DiffChunk::Copy { offset: 10, length: 4 },
        ];
        assert_eq!(apply_diff(old, &chunks).unwrap(), b"AAAA_XXXX_CCCC");
    }

    #[test]
    fn test_apply_empty_chunks() {
        assert!(apply_diff(b"some data", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_copy_past_end_is_rejected() {
        let chunks = vec![DiffChunk::Copy { offset: 10, length: 5 }];
        let err = apply_diff(b"short", &chunks).unwrap_err();
        assert!(matches!(
            err,
            CodecError::CopyOutOfRange {
                offset: 10,
                length: 5,
                base_len: 5
            }
        ));
    }

    #[test]
    fn test_overflowing_copy_is_rejected() {
        let chunks = vec![DiffChunk::Copy {
            offset: u64::MAX,
            length: 2,
        }];
        assert!(apply_diff(b"abc", &chunks).is_err());
    }
}
