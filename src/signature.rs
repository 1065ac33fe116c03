//! Content-similarity signatures — the platform-independent content key.
//!
//! Every [`NarrativeUnit`](crate::model::NarrativeUnit) carries a fixed-length
//! numeric signature produced upstream (a locality-sensitive hash, a sentence
//! embedding, a MinHash sketch projected to floats — the engine does not care
//! which). Two units whose signatures point the same way say the same thing.
//!
//! This module owns the arithmetic on those vectors:
//!
//! - [`ContentSignature::cosine_similarity`] for fingerprint and content comparisons
//! - [`centroid`] for the per-actor content block of a fingerprint
//! - [`fnv1a64`] for stable, restart-independent identifiers
//!
//! # Invariants
//! - Signatures are validated at ingress (finite values, configured length);
//!   nothing in here re-checks them.
//! - Hashes are deterministic across processes and platforms.

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;
/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 1_099_511_628_211;

/// Norm below which a vector is treated as carrying no direction.
const NORM_EPSILON: f32 = 1e-9;

/// Deterministic FNV-1a hash over a byte stream.
///
/// Used for cluster and bundle identifiers: the same member list produces
/// the same hash on every run.
pub fn fnv1a64<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> u64 {
    let mut h = FNV_OFFSET;
    for chunk in chunks {
        for &b in chunk {
            h ^= b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        // chunk separator so ["ab", "c"] and ["a", "bc"] differ
        h ^= 0xff;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Euclidean norm of a slice.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between two equal-length slices, clamped to [-1.0, 1.0].
///
/// Returns 0.0 when either vector has no direction or the lengths differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = norm(a);
    let norm_b = norm(b);
    if norm_a < NORM_EPSILON || norm_b < NORM_EPSILON {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

/// Arithmetic mean of a set of equal-length vectors.
///
/// Returns `None` for an empty input. Vectors whose length disagrees with the
/// first one are skipped.
pub fn centroid<'a>(vectors: impl IntoIterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut iter = vectors.into_iter();
    let first = iter.next()?;
    let mut sum: Vec<f64> = first.iter().map(|&x| x as f64).collect();
    let mut n = 1usize;
    for v in iter {
        if v.len() != sum.len() {
            continue;
        }
        for (s, &x) in sum.iter_mut().zip(v.iter()) {
            *s += x as f64;
        }
        n += 1;
    }
    Some(sum.into_iter().map(|s| (s / n as f64) as f32).collect())
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n >= NORM_EPSILON {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

/// A fixed-length content-similarity signature.
///
/// The length is fixed per deployment (`GraphConfig::signature_dim`) and
/// enforced at ingestion.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(transparent))]
pub struct ContentSignature(Vec<f32>);

impl ContentSignature {
    /// Wrap a raw vector. No validation — see `NarrativeGraph::ingest`.
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Dimensionality of the signature.
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Raw components.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|x| x.is_finite())
    }

    /// Cosine similarity to another signature in [-1.0, 1.0].
    pub fn cosine_similarity(&self, other: &Self) -> f32 {
        cosine(&self.0, &other.0)
    }

    /// Deterministic digest of the quantised signature.
    ///
    /// Components are clamped to [-1.0, 1.0] and quantised to `i16` so that
    /// float noise below ~3e-5 does not change the digest.
    pub fn digest(&self) -> u64 {
        let mut h = FNV_OFFSET;
        for &f in &self.0 {
            let q = (f.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            for b in q.to_le_bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(FNV_PRIME);
            }
        }
        h
    }
}

impl From<Vec<f32>> for ContentSignature {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}
