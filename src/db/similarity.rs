//! Types for perceptual-hash similarity search.

use std::fmt;

use super::models::FileRecord;

/// Maximum Hamming distance (out of 64 bits) at which two files count as similar.
/// 0 = identical, 1-5 = very similar, 6-10 = similar, 11-15 = somewhat similar.
pub const SIMILARITY_THRESHOLD: u32 = 13;

/// 64-bit perceptual fingerprint of a still image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Signed reinterpretation used for BIGINT/INTEGER columns. The bit pattern is preserved.
    pub fn to_db(self) -> i64 {
        self.0 as i64
    }

    pub fn from_db(value: i64) -> Self {
        Self(value as u64)
    }

    pub fn distance(self, other: PerceptualHash) -> u32 {
        hamming_distance(self, other)
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Number of differing bits between two perceptual hashes.
pub fn hamming_distance(a: PerceptualHash, b: PerceptualHash) -> u32 {
    (a.0 ^ b.0).count_ones()
}

/// A file found by a similarity query together with its distance to the query hash.
#[derive(Debug, Clone)]
pub struct SimilarityCandidate {
    pub file: FileRecord,
    pub distance: u32,
}

/// Orders candidates closest first, breaking ties by identity so results are stable.
pub fn sort_candidates(candidates: &mut [SimilarityCandidate]) {
    candidates.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| a.file.id.cmp(&b.file.id))
    });
}
