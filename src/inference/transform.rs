//! Score transforms applied before candidate selection.
//!
//! Temperature scaling and repetition penalty operate on non-negative weights (probability
//! domain). `softmax` bridges logit-like scores into that domain.

use crate::error::{Result, SamplingError, invalid};
use crate::inference::TokenId;

/// Raise every weight to `1/temperature` and renormalize to sum to one.
///
/// # Errors
/// `InvalidParameter` for a non-positive or non-finite temperature, `DegenerateDistribution`
/// when no positive mass is left after scaling.
pub fn apply_temperature(scores: &mut [f32], temperature: f32) -> Result<()> {
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(invalid(format!(
            "temperature must be > 0, got {temperature}"
        )));
    }

    let inv_t = temperature.recip();
    if (inv_t - 1.0).abs() > 1e-6 {
        for v in scores.iter_mut() {
            *v = v.powf(inv_t);
        }
    }

    normalize(scores)
}

/// Divide the weight of every positive, recently emitted token by `penalty`.
///
/// Each occurrence in `recent` applies the division once. The vector is not renormalized.
///
/// # Errors
/// `InvalidParameter` when `penalty` is below one or not finite.
pub fn relieve_repetition(scores: &mut [f32], recent: &[TokenId], penalty: f32) -> Result<()> {
    if !(penalty.is_finite() && penalty >= 1.0) {
        return Err(invalid(format!(
            "repetition_penalty must be >= 1, got {penalty}"
        )));
    }

    for &token in recent {
        if let Some(w) = scores.get_mut(token as usize)
            && *w > 0.0
        {
            *w /= penalty;
        }
    }
    Ok(())
}

/// Divide every weight by the total so the vector sums to one.
///
/// # Errors
/// `DegenerateDistribution` when the total is not a positive finite number.
pub fn normalize(scores: &mut [f32]) -> Result<()> {
    let sum: f32 = scores.iter().filter(|v| v.is_finite() && **v > 0.0).sum();
    if !(sum.is_finite() && sum > 0.0) {
        return Err(SamplingError::DegenerateDistribution(format!(
            "weights sum to {sum} across {} entries",
            scores.len()
        )));
    }

    for v in scores.iter_mut() {
        *v = if v.is_finite() && *v > 0.0 { *v / sum } else { 0.0 };
    }
    Ok(())
}

/// Numerically stable softmax. Non-finite entries get zero mass.
///
/// Returns all zeros when nothing is finite.
#[must_use]
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let Some(max_score) = scores
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .reduce(f32::max)
    else {
        return vec![0.0; scores.len()];
    };

    let exps = scores
        .iter()
        .map(|&v| if v.is_finite() { (v - max_score).exp() } else { 0.0 })
        .collect::<Vec<_>>();
    // The max entry contributes exp(0) = 1, so the total is at least 1.
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_temperature_one_is_identity_on_normalized_input() {
        let mut scores = vec![0.4, 0.3, 0.2, 0.1];
        apply_temperature(&mut scores, 1.0).unwrap();
        assert_close(&scores, &[0.4, 0.3, 0.2, 0.1]);
    }

    #[test]
    fn test_temperature_renormalizes_raw_weights() {
        let mut scores = vec![2.0, 6.0];
        apply_temperature(&mut scores, 1.0).unwrap();
        assert_close(&scores, &[0.25, 0.75]);
    }

    #[test]
    fn test_low_temperature_sharpens() {
        let mut scores = vec![0.6, 0.4];
        apply_temperature(&mut scores, 0.5).unwrap();
        // 0.36 / (0.36 + 0.16)
        assert!((scores[0] - 0.36 / 0.52).abs() < 1e-5);
        assert!(scores[0] > 0.6);
    }

    #[test]
    fn test_high_temperature_flattens() {
        let mut scores = vec![0.9, 0.1];
        apply_temperature(&mut scores, 4.0).unwrap();
        assert!(scores[0] < 0.9);
        assert!((scores.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_non_positive_temperature_rejected() {
        for t in [0.0, -1.0, f32::NAN] {
            let mut scores = vec![0.5, 0.5];
            let err = apply_temperature(&mut scores, t).unwrap_err();
            assert!(matches!(err, SamplingError::InvalidParameter(_)), "{err}");
        }
    }

    #[test]
    fn test_all_zero_weights_are_degenerate() {
        let mut scores = vec![0.0; 4];
        let err = apply_temperature(&mut scores, 1.0).unwrap_err();
        assert!(matches!(err, SamplingError::DegenerateDistribution(_)));
    }

    #[test]
    fn test_relieve_repetition_divides_positive_weights() {
        let mut scores = vec![0.4, 0.3, 0.2, 0.1];
        relieve_repetition(&mut scores, &[1, 3], 2.0).unwrap();
        assert_close(&scores, &[0.4, 0.15, 0.2, 0.05]);
    }

    #[test]
    fn test_relieve_repetition_compounds_per_occurrence() {
        let mut scores = vec![0.8, 0.2];
        relieve_repetition(&mut scores, &[0, 0], 2.0).unwrap();
        assert!((scores[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_relieve_repetition_leaves_zero_and_out_of_range() {
        let mut scores = vec![0.0, 1.0];
        relieve_repetition(&mut scores, &[0, 7], 1.5).unwrap();
        assert_close(&scores, &[0.0, 1.0]);
    }

    #[test]
    fn test_relieve_repetition_rejects_penalty_below_one() {
        let mut scores = vec![1.0];
        assert!(relieve_repetition(&mut scores, &[0], 0.9).is_err());
    }

    #[test]
    fn test_softmax_handles_neg_inf() {
        let probs = softmax(&[0.0, f32::NEG_INFINITY, 0.0]);
        assert_close(&probs, &[0.5, 0.0, 0.5]);
    }

    #[test]
    fn test_softmax_all_neg_inf_is_zero() {
        let probs = softmax(&[f32::NEG_INFINITY; 3]);
        assert!(probs.iter().all(|p| *p == 0.0));
    }
}
