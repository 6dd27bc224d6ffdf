//! Vector math: validation, cosine similarity and blob encoding

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a vector was refused by the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IndexDiagnostic {
    EmptyVector,
    NonFiniteComponent { position: usize },
    ZeroNorm,
    DimensionMismatch { expected: usize, got: usize },
    CorruptBlob { bytes: usize },
}

impl fmt::Display for IndexDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexDiagnostic::EmptyVector => write!(f, "vector is empty"),
            IndexDiagnostic::NonFiniteComponent { position } => {
                write!(f, "vector component {} is not finite", position)
            }
            IndexDiagnostic::ZeroNorm => write!(f, "vector has zero norm"),
            IndexDiagnostic::DimensionMismatch { expected, got } => {
                write!(f, "dimension mismatch: expected {}, got {}", expected, got)
            }
            IndexDiagnostic::CorruptBlob { bytes } => {
                write!(f, "embedding blob of {} bytes is not a whole number of f32s", bytes)
            }
        }
    }
}

impl From<IndexDiagnostic> for crate::error::RecallError {
    fn from(d: IndexDiagnostic) -> Self {
        crate::error::RecallError::PermanentValidation(d.to_string())
    }
}

/// Check a vector for emptiness, NaN/inf components and zero norm.
///
/// Returns the L2 norm on success.
pub fn validate(vector: &[f32]) -> Result<f32, IndexDiagnostic> {
    if vector.is_empty() {
        return Err(IndexDiagnostic::EmptyVector);
    }
    if let Some(position) = vector.iter().position(|x| !x.is_finite()) {
        return Err(IndexDiagnostic::NonFiniteComponent { position });
    }
    let norm = l2_norm(vector);
    if norm < 1e-10 {
        return Err(IndexDiagnostic::ZeroNorm);
    }
    Ok(norm)
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector
        .iter()
        .map(|x| (*x as f64) * (*x as f64))
        .sum::<f64>()
        .sqrt() as f32
}

/// Raw cosine similarity in [-1, 1]; 0.0 for mismatched or degenerate input
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Cosine with precomputed norms, clamped to [0, 1]
pub(crate) fn normalized_cosine(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    let denom = (a_norm as f64) * (b_norm as f64);
    if denom < 1e-10 {
        return 0.0;
    }
    ((dot / denom) as f32).clamp(0.0, 1.0)
}

/// Fraction of components that are non-zero
pub fn density(vector: &[f32]) -> f32 {
    if vector.is_empty() {
        return 0.0;
    }
    vector.iter().filter(|x| x.abs() > f32::EPSILON).count() as f32 / vector.len() as f32
}

/// Encode as little-endian f32 bytes for BLOB columns
pub fn to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Decode a little-endian f32 BLOB
pub fn from_blob(blob: &[u8]) -> Result<Vec<f32>, IndexDiagnostic> {
    if blob.len() % 4 != 0 {
        return Err(IndexDiagnostic::CorruptBlob { bytes: blob.len() });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
