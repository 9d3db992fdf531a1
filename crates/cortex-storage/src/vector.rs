//! Fixed-dimension vectors stored as little-endian f32 BLOBs.

use crate::error::{Result, StorageError};

/// Cosine similarity in [-1, 1]. Zero-magnitude vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn encode(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StorageError::Misconfigured(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Reject vectors that do not match the tenant-wide configured dimension.
pub fn check_dim(vec: &[f32], expected: usize) -> Result<()> {
    if vec.len() != expected {
        return Err(StorageError::Conflict(format!(
            "embedding dimension {} does not match configured {}",
            vec.len(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, -0.25, 1.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_mismatched_lengths_is_zero() {
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn encode_decode_round_trip() {
        let v = vec![1.0, -2.5, 0.0, 3.25];
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(decode(&[0, 1, 2]).is_err());
    }

    #[test]
    fn dim_mismatch_is_a_conflict() {
        let err = check_dim(&[1.0, 2.0], 3).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }
}
