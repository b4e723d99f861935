//! Distance metrics, ranking and the little-endian vector encoding shared by both backends.

use std::cmp::Ordering;

/// Squared Euclidean distance.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// `1 - cosine similarity`; a zero vector is maximally unrelated (distance 1).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return 1.0;
    }
    (1.0 - dot / denom) as f32
}

/// Orders `(position, distance)` pairs nearest-first and keeps at most `k`.
///
/// Ties keep insertion order; NaN distances sort last.
pub fn rank(mut scored: Vec<(usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    scored.sort_by(|a, b| compare_distance(a.1, b.1).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

fn compare_distance(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Encodes a vector as little-endian `f32` bytes.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decodes little-endian `f32` bytes, checking the expected dimension.
pub fn decode_vector(bytes: &[u8], dimension: usize) -> Result<Vec<f32>, String> {
    let expected = dimension * std::mem::size_of::<f32>();
    if bytes.len() != expected {
        return Err(format!(
            "invalid embedding byte length: expected {expected}, got {}",
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn metrics() {
        assert_eq!(squared_l2(&[1.0, 2.0], &[4.0, 6.0]), 25.0);
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 3.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn rank_is_stable_on_ties() {
        let ranked = rank(vec![(0, 0.5), (1, 0.1), (2, 0.5), (3, f32::NAN), (4, 0.1)], 4);
        let order: Vec<usize> = ranked.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(order, vec![1, 4, 0, 2]);
    }

    #[test]
    fn blob_encoding_checks_length() {
        let bytes = encode_vector(&[1.5, -2.0, 0.25]);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_vector(&bytes, 3).expect("decode"), vec![1.5, -2.0, 0.25]);
        assert!(decode_vector(&bytes, 4).is_err());
    }
}
