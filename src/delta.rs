//! Binary delta codec: the diff/patch primitive behind the repository.
//!
//! Diffing is rsync-style block matching: split the source into fixed-size
//! blocks, index them by rolling hash, slide a window over the target and
//! emit `Copy` chunks for matched blocks and `Insert` chunks for everything
//! else. The serialized payload frames the chunk list with a magic header
//! and embeds both endpoint checksums for tamper detection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::checksum::ContentChecksum;
use crate::rolling_hash::RollingHash;

pub const BLOCK_SIZE: usize = 4096;

pub const PAYLOAD_MAGIC: &[u8; 8] = b"MRGDIFF1";
pub const PAYLOAD_VERSION: u32 = 1;

/// Failure of the diff/patch primitive. Any malformed payload, truncated
/// frame, or out-of-range copy lands here; the primitive never panics on
/// bad input.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("corrupt delta payload: {0}")]
    Corrupt(String),
    #[error("unsupported delta payload version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiffChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

/// A decoded patch payload: the checksums of the transition endpoints plus
/// the chunk program that performs it.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeltaPayload {
    version: u32,
    pub source: ContentChecksum,
    pub target: ContentChecksum,
    chunks: Vec<DiffChunk>,
}

impl DeltaPayload {
    /// Build a payload transforming `source` into `target`.
    pub fn build(source: &[u8], target: &[u8]) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            source: ContentChecksum::compute(source),
            target: ContentChecksum::compute(target),
            chunks: compute_chunks(source, target),
        }
    }

    /// Build a payload that ignores the source entirely and inserts the
    /// target wholesale. Used for incompressible formats where block
    /// matching yields no savings.
    pub fn build_whole_file(source: &[u8], target: &[u8]) -> Self {
        let chunks = if target.is_empty() {
            vec![]
        } else {
            vec![DiffChunk::Insert {
                data: target.to_vec(),
            }]
        };
        Self {
            version: PAYLOAD_VERSION,
            source: ContentChecksum::compute(source),
            target: ContentChecksum::compute(target),
            chunks,
        }
    }

    /// Serialize: magic header followed by zstd-compressed bincode body.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        use anyhow::Context;

        let body = bincode::serialize(self).context("Failed to serialize delta payload")?;
        let compressed =
            zstd::bulk::compress(&body, 3).context("Failed to compress delta payload")?;

        let mut out = Vec::with_capacity(PAYLOAD_MAGIC.len() + compressed.len());
        out.extend_from_slice(PAYLOAD_MAGIC);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Parse a serialized payload. Every decode failure is `Corrupt`; a
    /// recognized frame with a newer version is `UnsupportedVersion`.
    pub fn decode(raw: &[u8]) -> Result<Self, DeltaError> {
        if raw.len() < PAYLOAD_MAGIC.len() || &raw[..PAYLOAD_MAGIC.len()] != PAYLOAD_MAGIC {
            return Err(DeltaError::Corrupt("missing magic header".into()));
        }

        let body = zstd::stream::decode_all(&raw[PAYLOAD_MAGIC.len()..])
            .map_err(|e| DeltaError::Corrupt(format!("zstd: {e}")))?;
        let payload: DeltaPayload = bincode::deserialize(&body)
            .map_err(|e| DeltaError::Corrupt(format!("bincode: {e}")))?;

        if payload.version != PAYLOAD_VERSION {
            return Err(DeltaError::UnsupportedVersion(payload.version));
        }
        Ok(payload)
    }

    /// Run the chunk program against `source`, producing the candidate
    /// target bytes. Deterministic: the same (source, payload) pair always
    /// yields the same output. Does not mutate or consume `source`.
    pub fn apply(&self, source: &[u8]) -> Result<Vec<u8>, DeltaError> {
        apply_chunks(source, &self.chunks, Some(self.target.length()))
    }
}

/// Every chunk is validated and the exact output length computed before a
/// single byte is allocated: a payload that decodes cleanly but carries an
/// out-of-range copy must fail with `Corrupt`, never abort on allocation.
/// `expected_len` additionally caps the output against the length the
/// payload claims for its target.
fn apply_chunks(
    source: &[u8],
    chunks: &[DiffChunk],
    expected_len: Option<u64>,
) -> Result<Vec<u8>, DeltaError> {
    let mut resolved: Vec<&[u8]> = Vec::with_capacity(chunks.len());
    let mut out_len: u64 = 0;
    for chunk in chunks {
        let piece: &[u8] = match chunk {
            DiffChunk::Copy { offset, length } => {
                let start = usize::try_from(*offset)
                    .map_err(|_| DeltaError::Corrupt("copy offset out of range".into()))?;
                let len = usize::try_from(*length)
                    .map_err(|_| DeltaError::Corrupt("copy length out of range".into()))?;
                let end = start
                    .checked_add(len)
                    .ok_or_else(|| DeltaError::Corrupt("copy range overflows".into()))?;
                source.get(start..end).ok_or_else(|| {
                    DeltaError::Corrupt(format!(
                        "copy {start}..{end} exceeds source length {}",
                        source.len()
                    ))
                })?
            }
            DiffChunk::Insert { data } => data,
        };
        out_len = out_len
            .checked_add(piece.len() as u64)
            .ok_or_else(|| DeltaError::Corrupt("output length overflows".into()))?;
        resolved.push(piece);
    }

    if let Some(expected) = expected_len {
        if out_len != expected {
            return Err(DeltaError::Corrupt(format!(
                "output length {out_len} disagrees with target length {expected}"
            )));
        }
    }
    let capacity = usize::try_from(out_len)
        .map_err(|_| DeltaError::Corrupt("output length exceeds address space".into()))?;

    let mut result = Vec::with_capacity(capacity);
    for piece in resolved {
        result.extend_from_slice(piece);
    }

    Ok(result)
}

struct BlockSignature {
    rolling: u32,
    strong: blake3::Hash,
    offset: u64,
}

/// Compute the chunk program turning `source` into `target`:
/// 1. Split source into fixed-size blocks
/// 2. Index blocks by rolling hash
/// 3. Slide a rolling-hash window over target, matching against the index
/// 4. Emit Copy chunks for matches, Insert chunks for gaps
fn compute_chunks(source: &[u8], target: &[u8]) -> Vec<DiffChunk> {
    if source.is_empty() {
        if target.is_empty() {
            return vec![];
        }
        return vec![DiffChunk::Insert {
            data: target.to_vec(),
        }];
    }

    let signatures = block_signatures(source);
    let index = signature_index(&signatures);

    match_blocks(source, target, &index, &signatures)
}

fn block_signatures(data: &[u8]) -> Vec<BlockSignature> {
    let num_blocks = data.len().div_ceil(BLOCK_SIZE);
    let mut sigs = Vec::with_capacity(num_blocks);

    for i in 0..num_blocks {
        let start = i * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(data.len());
        let block = &data[start..end];

        sigs.push(BlockSignature {
            rolling: RollingHash::from_window(block).digest(),
            strong: blake3::hash(block),
            offset: start as u64,
        });
    }

    sigs
}

fn signature_index(signatures: &[BlockSignature]) -> HashMap<u32, Vec<usize>> {
    let mut index: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        index.entry(sig.rolling).or_default().push(idx);
    }
    index
}

fn match_blocks(
    source: &[u8],
    target: &[u8],
    index: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Vec<DiffChunk> {
    let mut chunks: Vec<DiffChunk> = Vec::new();
    let mut insert_buf: Vec<u8> = Vec::new();

    if target.len() < BLOCK_SIZE {
        if target.is_empty() {
            return vec![];
        }
        return vec![DiffChunk::Insert {
            data: target.to_vec(),
        }];
    }

    let mut rolling = RollingHash::from_window(&target[..BLOCK_SIZE]);
    let mut pos: usize = 0;

    loop {
        let window_end = pos + BLOCK_SIZE;
        if window_end > target.len() {
            break;
        }

        if let Some((offset, length)) = find_match(
            rolling.digest(),
            &target[pos..window_end],
            source,
            index,
            signatures,
        ) {
            if !insert_buf.is_empty() {
                chunks.push(DiffChunk::Insert {
                    data: std::mem::take(&mut insert_buf),
                });
            }

            chunks.push(DiffChunk::Copy { offset, length });

            pos += length as usize;

            if pos + BLOCK_SIZE <= target.len() {
                rolling = RollingHash::from_window(&target[pos..pos + BLOCK_SIZE]);
            }
        } else {
            insert_buf.push(target[pos]);
            pos += 1;

            if pos + BLOCK_SIZE <= target.len() {
                rolling.roll(target[pos - 1], target[pos + BLOCK_SIZE - 1]);
            }
        }
    }

    // Tail bytes that never filled a complete window.
    if pos < target.len() {
        insert_buf.extend_from_slice(&target[pos..]);
    }

    if !insert_buf.is_empty() {
        chunks.push(DiffChunk::Insert { data: insert_buf });
    }

    chunks
}

/// Confirm a rolling-hash candidate with the strong hash.
/// Returns (source_offset, length) on a real match.
fn find_match(
    rolling_digest: u32,
    window: &[u8],
    source: &[u8],
    index: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Option<(u64, u64)> {
    let candidates = index.get(&rolling_digest)?;

    let strong = blake3::hash(window);

    for &sig_idx in candidates {
        let sig = &signatures[sig_idx];
        if sig.strong == strong {
            let block_end = (sig.offset as usize + BLOCK_SIZE).min(source.len());
            let block_len = block_end - sig.offset as usize;
            return Some((sig.offset, block_len as u64));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(source: &[u8], target: &[u8]) {
        let payload = DeltaPayload::build(source, target);
        let encoded = payload.encode().unwrap();
        let decoded = DeltaPayload::decode(&encoded).unwrap();
        assert_eq!(decoded.apply(source).unwrap(), target);
    }

    #[test]
    fn test_identical_data() {
        let data = vec![42u8; BLOCK_SIZE * 3];
        round_trip(&data, &data);
    }

    #[test]
    fn test_completely_different() {
        round_trip(&vec![0u8; BLOCK_SIZE * 2], &vec![1u8; BLOCK_SIZE * 2]);
    }

    #[test]
    fn test_prefix_changed_reuses_blocks() {
        let source = vec![0u8; BLOCK_SIZE * 4];
        let mut target = source.clone();
        for b in target[..BLOCK_SIZE].iter_mut() {
            *b = 0xFF;
        }

        let chunks = compute_chunks(&source, &target);
        assert_eq!(apply_chunks(&source, &chunks, None).unwrap(), target);

        let copy_count = chunks
            .iter()
            .filter(|c| matches!(c, DiffChunk::Copy { .. }))
            .count();
        assert!(copy_count >= 3, "Expected Copy chunks for unchanged blocks");
    }

    #[test]
    fn test_empty_source() {
        round_trip(&[], &[1u8; 100]);
    }

    #[test]
    fn test_empty_target() {
        round_trip(&[1u8; 100], &[]);
    }

    #[test]
    fn test_small_files() {
        round_trip(b"Hello, World!", b"Hello, Rust!");
    }

    #[test]
    fn test_single_byte_change() {
        round_trip(b"AAAA", b"AAAB");
    }

    #[test]
    fn test_insertion_in_middle() {
        let mut source = vec![0u8; BLOCK_SIZE * 4];
        for (i, b) in source.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let mut target = source.clone();
        let insert_pos = BLOCK_SIZE * 2;
        target.splice(insert_pos..insert_pos, vec![0xAA; 100]);

        round_trip(&source, &target);
    }

    #[test]
    fn test_apply_is_deterministic_and_nonconsuming() {
        let source = b"AAAA".to_vec();
        let payload = DeltaPayload::build(&source, b"AAAB");
        let first = payload.apply(&source).unwrap();
        let second = payload.apply(&source).unwrap();
        assert_eq!(first, b"AAAB");
        assert_eq!(first, second);
        assert_eq!(source, b"AAAA");
    }

    #[test]
    fn test_whole_file_payload() {
        let source = vec![1u8; BLOCK_SIZE];
        let target = vec![2u8; BLOCK_SIZE];
        let payload = DeltaPayload::build_whole_file(&source, &target);
        assert_eq!(payload.apply(&source).unwrap(), target);
        // Must not depend on the source at all.
        assert_eq!(payload.apply(&[]).unwrap(), target);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let err = DeltaPayload::decode(b"NOTMAGIC rest").unwrap_err();
        assert!(matches!(err, DeltaError::Corrupt(_)));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let payload = DeltaPayload::build(b"some source bytes", b"some target bytes");
        let encoded = payload.encode().unwrap();
        let err = DeltaPayload::decode(&encoded[..encoded.len() / 2]).unwrap_err();
        assert!(matches!(err, DeltaError::Corrupt(_)));
    }

    #[test]
    fn test_apply_rejects_out_of_range_copy() {
        let chunks = vec![DiffChunk::Copy {
            offset: 4,
            length: 100,
        }];
        let err = apply_chunks(b"tiny", &chunks, None).unwrap_err();
        assert!(matches!(err, DeltaError::Corrupt(_)));
    }

    #[test]
    fn test_apply_rejects_huge_copy_without_allocating() {
        // A copy length near u64::MAX must be rejected by validation, not
        // attempted as an allocation.
        let chunks = vec![DiffChunk::Copy {
            offset: 0,
            length: 1 << 62,
        }];
        let err = apply_chunks(b"tiny", &chunks, None).unwrap_err();
        assert!(matches!(err, DeltaError::Corrupt(_)));
    }

    #[test]
    fn test_apply_rejects_output_disagreeing_with_target_length() {
        let chunks = vec![DiffChunk::Insert {
            data: b"ten bytes!".to_vec(),
        }];
        let err = apply_chunks(b"", &chunks, Some(4)).unwrap_err();
        assert!(matches!(err, DeltaError::Corrupt(_)));
        assert!(apply_chunks(b"", &chunks, Some(10)).is_ok());
    }
}
