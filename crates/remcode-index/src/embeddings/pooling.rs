//! Vector reductions.

/// Element-wise mean of token vectors.
///
/// Returns `None` for an empty or ragged input.
pub fn mean_pool(tokens: &[Vec<f32>]) -> Option<Vec<f32>> {
    let width = tokens.first()?.len();
    if width == 0 || tokens.iter().any(|t| t.len() != width) {
        return None;
    }

    let mut pooled = vec![0.0f32; width];
    for token in tokens {
        for (acc, value) in pooled.iter_mut().zip(token) {
            *acc += value;
        }
    }
    let count = tokens.len() as f32;
    pooled.iter_mut().for_each(|v| *v /= count);
    Some(pooled)
}

/// Scale a vector to unit length in place. Zero vectors are left as is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pool() {
        let pooled = mean_pool(&[vec![1.0, 2.0, 3.0], vec![3.0, 4.0, 5.0]]).unwrap();
        assert_eq!(pooled, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_mean_pool_single_token_is_identity() {
        assert_eq!(mean_pool(&[vec![0.5, -0.5]]), Some(vec![0.5, -0.5]));
    }

    #[test]
    fn test_mean_pool_rejects_bad_input() {
        assert_eq!(mean_pool(&[]), None);
        assert_eq!(mean_pool(&[vec![1.0], vec![1.0, 2.0]]), None);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
