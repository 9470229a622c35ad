//! Embedding function
//!
//! Maps a failure fingerprint to a fixed-length vector. Embeddings must be
//! deterministic: the same fingerprint always yields the same vector for a
//! given [`Embedder::version`].

use veritas_databases::FingerprintFields;

/// Deterministic, versioned fingerprint embedding
pub trait Embedder: Send + Sync {
    fn embed(&self, fields: &FingerprintFields) -> Vec<f32>;

    fn dimension(&self) -> usize;

    /// Changes whenever the produced vectors would change
    fn version(&self) -> String;
}

const TYPE_WEIGHT: f32 = 0.2;
const FILE_WEIGHT: f32 = 0.6;
const MESSAGE_WEIGHT: f32 = 0.6;

/// Hashes per file path; the whole path is one feature
const FILE_HASHES: u64 = 4;

/// Feature-hashing embedder.
///
/// The vector is split into three segments, one each for the failure type,
/// the file path and the message terms. Each segment is hashed with FNV-1a
/// into signed buckets, scaled by its weight, and the result L2-normalised.
/// Fingerprints that differ in file or message land well below a 0.95 cosine.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn segments(&self) -> (std::ops::Range<usize>, std::ops::Range<usize>, std::ops::Range<usize>) {
        let type_len = (self.dimension / 8).max(1);
        let file_len = (self.dimension / 4).max(1);
        let type_seg = 0..type_len;
        let file_seg = type_len..type_len + file_len;
        let message_seg = type_len + file_len..self.dimension;
        (type_seg, file_seg, message_seg)
    }

    fn tokenize(text: &str) -> Vec<&str> {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, fields: &FingerprintFields) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let (type_seg, file_seg, message_seg) = self.segments();

        let mut segment = vec![0.0f32; type_seg.len()];
        add_feature(&mut segment, fields.failure_type.as_str(), 0);
        write_segment(&mut vector[type_seg], &segment, TYPE_WEIGHT);

        let mut segment = vec![0.0f32; file_seg.len()];
        for seed in 0..FILE_HASHES {
            add_feature(&mut segment, &fields.file_path, seed);
        }
        write_segment(&mut vector[file_seg], &segment, FILE_WEIGHT);

        let mut segment = vec![0.0f32; message_seg.len()];
        let tokens = Self::tokenize(&fields.normalized_message);
        for token in &tokens {
            add_feature(&mut segment, token, 0);
        }
        // Bigrams keep word order significant
        for pair in tokens.windows(2) {
            add_feature(&mut segment, &format!("{} {}", pair[0], pair[1]), 1);
        }
        write_segment(&mut vector[message_seg], &segment, MESSAGE_WEIGHT);

        l2_normalize(&mut vector);
        vector
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn version(&self) -> String {
        format!("fnv-hashing-v1/{}", self.dimension)
    }
}

/// FNV-1a over the seed and the term
fn hash_term(term: &str, seed: u64) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in seed.to_le_bytes().iter().chain(term.as_bytes()) {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

fn add_feature(segment: &mut [f32], term: &str, seed: u64) {
    if segment.is_empty() {
        return;
    }
    let h = hash_term(term, seed);
    let bucket = (h % segment.len() as u64) as usize;
    let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
    segment[bucket] += sign;
}

fn write_segment(target: &mut [f32], segment: &[f32], weight: f32) {
    let norm: f32 = segment.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return;
    }
    for (out, value) in target.iter_mut().zip(segment) {
        *out = value / norm * weight;
    }
}

fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veritas_core::FailureType;
    use veritas_databases::cosine_similarity;

    fn fields(failure_type: FailureType, message: &str, file: &str) -> FingerprintFields {
        FingerprintFields {
            failure_type,
            normalized_message: message.to_string(),
            file_path: file.to_string(),
        }
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(256);
        let f = fields(FailureType::ImportError, "no module named 'x'", "/repo/a.py");
        let a = embedder.embed(&f);
        let b = embedder.embed(&f);
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "expected unit norm, got {norm}");
    }

    #[test]
    fn test_identical_fingerprints_clear_threshold() {
        let embedder = HashingEmbedder::new(256);
        let f = fields(FailureType::SyntaxError, "invalid syntax at line 0", "/repo/b.py");
        let sim = cosine_similarity(&embedder.embed(&f), &embedder.embed(&f.clone()));
        assert!(sim >= 0.999);
    }

    #[test]
    fn test_different_file_or_message_stays_below_threshold() {
        let embedder = HashingEmbedder::new(256);
        let base = embedder.embed(&fields(
            FailureType::ImportError,
            "no module named 'requests'",
            "/repo/a.py",
        ));
        let other_file = embedder.embed(&fields(
            FailureType::ImportError,
            "no module named 'requests'",
            "/repo/b.py",
        ));
        let other_message = embedder.embed(&fields(
            FailureType::ImportError,
            "cannot import name 'session' from 'http'",
            "/repo/a.py",
        ));

        assert!(cosine_similarity(&base, &other_file) < 0.95);
        assert!(cosine_similarity(&base, &other_message) < 0.95);
    }

    #[test]
    fn test_version_tracks_dimension() {
        assert_ne!(
            HashingEmbedder::new(64).version(),
            HashingEmbedder::new(128).version()
        );
        assert_eq!(HashingEmbedder::new(64).dimension(), 64);
    }
}
