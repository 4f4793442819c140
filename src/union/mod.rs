//! The numerically stable union kernel (C1).
//!
//! Every probability roll-up in this crate — merging colliding worker
//! contributions, rolling a depth up into its parent, downsampling a
//! chunk's own emission — goes through one of the functions here, never
//! through the naive `1 - (1-a)(1-b)` product directly, so that a
//! probability near 1 never underflows `1 - p` before it gets combined.

use crate::Probability;

/// Replace a non-finite or out-of-`[0,1]` probability with `fallback`.
pub fn sanitize(p: Probability, fallback: Probability) -> Probability {
    if p.is_finite() && (0.0..=1.0).contains(&p) {
        p
    } else {
        fallback
    }
}

/// `P = 1 - exp(sum(log1p(-p_i)))` over an arbitrary number of inputs,
/// clamped to `[0, 1]`. Symmetric under permutation of the inputs.
///
/// Non-finite / out-of-range entries are replaced by `p_unknown` (itself
/// sanitized against `0.5` if it is out of range).
pub fn union_many(values: impl IntoIterator<Item = Probability>, p_unknown: Probability) -> Probability {
    let fallback = sanitize(p_unknown, 0.5);
    let sum_log_q: f64 = values
        .into_iter()
        .map(|p| sanitize(p, fallback))
        .map(|p| (-p).ln_1p())
        .sum();
    (1.0 - sum_log_q.exp()).clamp(0.0, 1.0)
}

/// The fixed 8-way form used by the hierarchy roll-up (§4.5 step 2): one
/// parent from exactly eight child slots, empty slots pre-filled by the
/// caller with `p_unknown`.
pub fn union8(values: [Probability; 8], p_unknown: Probability) -> Probability {
    union_many(values, p_unknown)
}

/// The two-way form used when two worker outputs collide on the same key
/// during the global merge (§4.5 step 1).
pub fn union2(a: Probability, b: Probability, p_unknown: Probability) -> Probability {
    union_many([a, b], p_unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zeros_is_zero() {
        assert_eq!(union8([0.0; 8], 0.5), 0.0);
    }

    #[test]
    fn all_ones_is_one() {
        assert_eq!(union8([1.0; 8], 0.5), 1.0);
    }

    #[test]
    fn invalid_entries_fall_back_to_p_unknown() {
        let with_nan = union8([f64::NAN, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0.5);
        let with_unknown = union8([0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0.5);
        assert!((with_nan - with_unknown).abs() < 1e-12);

        let out_of_range = union8([1.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0.5);
        assert!((out_of_range - with_unknown).abs() < 1e-12);
    }

    #[test]
    fn permutation_invariant() {
        let values = [0.1, 0.9, 0.0, 0.5, 0.33, 0.77, 0.2, 0.6];
        let mut permuted = values;
        permuted.reverse();
        let a = union8(values, 0.5);
        let b = union8(permuted, 0.5);
        assert!((a - b).abs() <= f64::EPSILON * 4.0);
    }

    #[test]
    fn matches_reference_formula() {
        let values = [0.1, 0.9, 0.0, 0.5, 0.33, 0.77, 0.2, 0.6];
        let reference: f64 = 1.0 - values.iter().map(|p| 1.0 - p).product::<f64>();
        let stable = union8(values, 0.5);
        assert!((stable - reference).abs() < 1e-9);
    }

    #[test]
    fn two_way_matches_naive_product() {
        assert!((union2(0.7, 0.7, 0.5) - 0.91).abs() < 1e-12);
    }

    #[test]
    fn p_unknown_itself_sanitized() {
        // An out-of-range p_unknown falls back to 0.5 rather than propagating NaN.
        let result = union8([f64::NAN; 8], 2.0);
        assert!((result - union8([0.5; 8], 0.5)).abs() < 1e-12);
    }
}
