//! Deterministic feature-hashing embedder that runs without network access.

/// Default output dimension of the local embedder.
pub const DEFAULT_LOCAL_DIMENSION: usize = 384;
/// Model name reported for the local embedder.
pub const LOCAL_MODEL_NAME: &str = "local-feature-hash";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hashes lower-cased word unigrams and adjacent word pairs into signed buckets.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Builds an embedder producing vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Vector length produced by this embedder.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embeds one text into an L2-normalised vector.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let tokens = tokenize(text);
        for token in &tokens {
            self.accumulate(&mut vector, "w:", token);
        }
        for pair in tokens.windows(2) {
            let (first, second) = if pair[0] <= pair[1] {
                (&pair[0], &pair[1])
            } else {
                (&pair[1], &pair[0])
            };
            self.accumulate(&mut vector, "b:", &format!("{first} {second}"));
        }
        normalize(&mut vector);
        vector
    }

    fn accumulate(&self, vector: &mut [f32], prefix: &str, feature: &str) {
        let hash = fnv1a(prefix.as_bytes().iter().chain(feature.as_bytes()));
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
        vector[bucket] += sign;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_DIMENSION)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn fnv1a<'a>(bytes: impl Iterator<Item = &'a u8>) -> u64 {
    bytes.fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identical_text_gives_identical_vectors() {
        let embedder = HashingEmbedder::default();
        let first = embedder.embed("ML is a subset of AI.");
        let second = embedder.embed("ML is a subset of AI.");
        assert_eq!(first.len(), DEFAULT_LOCAL_DIMENSION);
        assert_eq!(
            first.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            second.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn vectors_are_unit_length() {
        let embedder = HashingEmbedder::new(64);
        let vector = embedder.embed("Deep learning is a subset of machine learning");
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm was {norm}");
    }

    #[test]
    fn case_and_punctuation_are_ignored() {
        let embedder = HashingEmbedder::new(128);
        assert_eq!(embedder.embed("Hello, World!"), embedder.embed("hello world"));
    }

    #[test]
    fn text_without_words_embeds_to_zero() {
        let embedder = HashingEmbedder::new(16);
        assert_eq!(embedder.embed(" ... "), vec![0.0; 16]);
    }

    #[test]
    fn fnv_matches_reference_values() {
        assert_eq!(fnv1a(b"".iter()), FNV_OFFSET);
        assert_eq!(fnv1a(b"a".iter()), 0xaf63_dc4c_8601_ec8c);
    }
}
