//! Per-tree level policies (C6): deciding, for each root tree of an
//! `n`x`n`x`n` brick, how deep its octree forest should refine.
//!
//! Every policy ultimately produces one `u16` per tree, clamped to
//! `[min_level, max_level]` (§4.6). The policies differ only in what
//! statistic of the hierarchy they consult to make that choice.

use crate::error::Error;
use crate::hierarchy::Hierarchy;

/// A configured level-selection strategy.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum LevelPolicy {
    /// Every tree gets the same level.
    Uniform(u16),
    /// Tree `i` gets `levels[i]` (mismatched length falls back to
    /// `Uniform(0)`, clamped like any other policy's output).
    Explicit(Vec<u16>),
    /// Linear interpolation between `l_min` and `l_max` by each tree's
    /// leaf count relative to the forest's minimum and maximum.
    ByLeafcountLinear { l_min: u16, l_max: u16 },
    /// Three-way split by leaf-count quantile: below `q_lo` gets
    /// `l_low`, above `q_hi` gets `l_high`, the middle band gets
    /// `l_mid`. Rejects `q_lo > q_hi` as malformed (§9).
    ByLeafcountQuantiles {
        q_lo: f64,
        q_hi: f64,
        l_low: u16,
        l_mid: u16,
        l_high: u16,
    },
    /// Two-way split by a tree's mean occupancy probability against `t`.
    ByMeanProbThreshold { t: f64, l_low: u16, l_high: u16 },
    /// Walks `thresholds` in order, advancing to the next band only when
    /// a tree's leaf count is strictly greater than the current band's
    /// threshold (§9); `levels.len()` must be `thresholds.len() + 1`.
    BandsByCount { thresholds: Vec<usize>, levels: Vec<u16> },
    /// Same walk as [`LevelPolicy::BandsByCount`] but over each tree's
    /// mean probability instead of its leaf count.
    BandsByMeanProb { thresholds: Vec<f64>, levels: Vec<u16> },
}

struct TreeStats {
    leaf_count: usize,
    mean_prob: f64,
}

/// Compute one level per root tree of an `n`x`n`x`n` brick.
pub fn compute_levels(
    hierarchy: &Hierarchy,
    n: usize,
    policy: &LevelPolicy,
    min_level: u16,
    max_level: u16,
) -> Result<Vec<u16>, Error> {
    if n == 0 {
        return Err(Error::InvalidInput("n must be at least 1".to_string()));
    }
    if min_level > max_level {
        return Err(Error::InvalidInput(format!(
            "min_level {min_level} exceeds max_level {max_level}"
        )));
    }
    if let LevelPolicy::ByLeafcountQuantiles { q_lo, q_hi, .. } = policy {
        if q_lo > q_hi {
            return Err(Error::InvalidInput(format!("q_lo {q_lo} exceeds q_hi {q_hi}")));
        }
    }

    let num_trees = n * n * n;
    let stats = collect_tree_stats(hierarchy, n, num_trees);
    let clamp = |level: u16| level.clamp(min_level, max_level);

    let levels = match policy {
        LevelPolicy::Uniform(level) => vec![clamp(*level); num_trees],

        LevelPolicy::Explicit(levels) => {
            if levels.len() == num_trees {
                levels.iter().map(|&l| clamp(l)).collect()
            } else {
                vec![clamp(0); num_trees]
            }
        }

        LevelPolicy::ByLeafcountLinear { l_min, l_max } => {
            let counts: Vec<usize> = stats.iter().map(|s| s.leaf_count).collect();
            let lo = *counts.iter().min().unwrap_or(&0) as f64;
            let hi = *counts.iter().max().unwrap_or(&0) as f64;
            counts
                .iter()
                .map(|&c| {
                    let level = if hi > lo {
                        let t = (c as f64 - lo) / (hi - lo);
                        *l_min as f64 + t * (*l_max as f64 - *l_min as f64)
                    } else {
                        *l_min as f64
                    };
                    clamp(level.round() as u16)
                })
                .collect()
        }

        LevelPolicy::ByLeafcountQuantiles { q_lo, q_hi, l_low, l_mid, l_high } => {
            let mut counts: Vec<usize> = stats.iter().map(|s| s.leaf_count).collect();
            counts.sort_unstable();
            let lo_threshold = quantile(&counts, *q_lo);
            let hi_threshold = quantile(&counts, *q_hi);
            stats
                .iter()
                .map(|s| {
                    let c = s.leaf_count;
                    if c <= lo_threshold {
                        clamp(*l_low)
                    } else if c >= hi_threshold {
                        clamp(*l_high)
                    } else {
                        clamp(*l_mid)
                    }
                })
                .collect()
        }

        LevelPolicy::ByMeanProbThreshold { t, l_low, l_high } => stats
            .iter()
            .map(|s| if s.mean_prob >= *t { clamp(*l_high) } else { clamp(*l_low) })
            .collect(),

        LevelPolicy::BandsByCount { thresholds, levels } => {
            if levels.len() != thresholds.len() + 1 {
                vec![clamp(0); num_trees]
            } else {
                stats
                    .iter()
                    .map(|s| clamp(levels[band_index(s.leaf_count, thresholds)]))
                    .collect()
            }
        }

        LevelPolicy::BandsByMeanProb { thresholds, levels } => {
            if levels.len() != thresholds.len() + 1 {
                vec![clamp(0); num_trees]
            } else {
                stats
                    .iter()
                    .map(|s| clamp(levels[band_index(s.mean_prob, thresholds)]))
                    .collect()
            }
        }
    };

    Ok(levels)
}

/// Walk `thresholds` in ascending order, advancing to the next band only
/// while `value` is strictly greater than the current threshold (§9): a
/// value equal to a threshold stays in the lower band.
fn band_index<T: PartialOrd + Copy>(value: T, thresholds: &[T]) -> usize {
    let mut band = 0;
    while band < thresholds.len() && value > thresholds[band] {
        band += 1;
    }
    band
}

/// The threshold at quantile `q`: `sorted_counts[round(q * (N - 1))]`,
/// `q` clamped to `[0, 1]` (§4.6 policy 4). Not interpolated between
/// adjacent entries — a single sorted index.
fn quantile(sorted_counts: &[usize], q: f64) -> usize {
    if sorted_counts.is_empty() {
        return 0;
    }
    let q = q.clamp(0.0, 1.0);
    let position = (q * (sorted_counts.len() - 1) as f64).round() as usize;
    sorted_counts[position.min(sorted_counts.len() - 1)]
}

fn collect_tree_stats(hierarchy: &Hierarchy, n: usize, num_trees: usize) -> Vec<TreeStats> {
    let td = hierarchy.finest_depth();
    let mut leaf_counts = vec![0usize; num_trees];
    let mut prob_sums = vec![0.0f64; num_trees];

    for (nd_key, node) in hierarchy.iter() {
        if nd_key.depth != td || !node.is_leaf {
            continue;
        }
        let (tree, _local) = crate::hierarchy::split(nd_key.key, n);
        let tree_idx = crate::hierarchy::tree_linear_index(tree, n);
        if tree_idx < num_trees {
            leaf_counts[tree_idx] += 1;
            prob_sums[tree_idx] += node.probability;
        }
    }

    (0..num_trees)
        .map(|i| {
            let count = leaf_counts[i];
            let mean = if count > 0 { prob_sums[i] / count as f64 } else { 0.0 };
            TreeStats { leaf_count: count, mean_prob: mean }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupancy::WorkerOutput;

    /// Builds a hierarchy whose finest-depth leaves are distributed one
    /// tree at a time, `counts[tree_idx]` leaves each, using `split`'s
    /// mod/div brick partitioning (§4.7) so `tree_idx` in `counts` lines
    /// up with [`crate::hierarchy::tree_linear_index`].
    fn hierarchy_with_leaf_counts(counts: &[usize]) -> (Hierarchy, usize) {
        let n = (counts.len() as f64).cbrt().round() as usize;
        let mut ptd = std::collections::HashMap::new();
        let td = 4u16;
        for (tree_idx, &count) in counts.iter().enumerate() {
            let tx = (tree_idx % n) as u32;
            let ty = ((tree_idx / n) % n) as u32;
            let tz = (tree_idx / (n * n)) as u32;
            for leaf in 0..count {
                let x = leaf as u32 * n as u32 + tx;
                ptd.insert(crate::hierarchy::Key::new(x, ty, tz), 0.5);
            }
        }
        let outputs = vec![WorkerOutput { td, ptd }];
        let h = Hierarchy::build(&outputs, 0.0, false, 0.5, 0).unwrap();
        (h, n)
    }

    #[test]
    fn uniform_policy_clamps_to_range() {
        let (h, n) = hierarchy_with_leaf_counts(&[1]);
        let levels = compute_levels(&h, n, &LevelPolicy::Uniform(50), 1, 5).unwrap();
        assert_eq!(levels, vec![5]);
    }

    #[test]
    fn rejects_q_lo_greater_than_q_hi() {
        let (h, n) = hierarchy_with_leaf_counts(&[1]);
        let policy = LevelPolicy::ByLeafcountQuantiles {
            q_lo: 0.9,
            q_hi: 0.1,
            l_low: 1,
            l_mid: 2,
            l_high: 3,
        };
        let err = compute_levels(&h, n, &policy, 0, 10).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn bands_by_count_advance_only_strictly_greater() {
        assert_eq!(band_index(5usize, &[5, 10]), 0);
        assert_eq!(band_index(6usize, &[5, 10]), 1);
        assert_eq!(band_index(10usize, &[5, 10]), 1);
        assert_eq!(band_index(11usize, &[5, 10]), 2);
    }

    #[test]
    fn mismatched_band_lengths_fall_back_to_uniform_zero() {
        let (h, n) = hierarchy_with_leaf_counts(&[1]);
        let policy = LevelPolicy::BandsByCount { thresholds: vec![1, 2], levels: vec![9] };
        let levels = compute_levels(&h, n, &policy, 0, 10).unwrap();
        assert_eq!(levels, vec![0]);
    }

    #[test]
    fn quantile_scenario_six_from_spec() {
        // §8 scenario 6: n=4, counts 0..63, q_lo=0.2, q_hi=0.8.
        let counts: Vec<usize> = (0..64).collect();
        let (h, n) = hierarchy_with_leaf_counts(&counts);
        let policy = LevelPolicy::ByLeafcountQuantiles {
            q_lo: 0.2,
            q_hi: 0.8,
            l_low: 4,
            l_mid: 7,
            l_high: 10,
        };
        let levels = compute_levels(&h, n, &policy, 0, 10).unwrap();
        assert!(levels.iter().all(|&l| (0..=10).contains(&l)));
        // lo threshold = sorted[round(0.2*63)] = sorted[13] = 13
        assert_eq!(levels[0], 4);
        assert_eq!(levels[13], 4);
        assert_eq!(levels[14], 7);
        // hi threshold = sorted[round(0.8*63)] = sorted[50] = 50
        assert_eq!(levels[49], 7);
        assert_eq!(levels[50], 10);
        assert_eq!(levels[63], 10);
    }

    #[test]
    fn quantile_policy_respects_bounds() {
        let counts: Vec<usize> = (0..64).collect();
        let (h, n) = hierarchy_with_leaf_counts(&counts);
        let policy = LevelPolicy::ByLeafcountQuantiles {
            q_lo: 0.25,
            q_hi: 0.75,
            l_low: 1,
            l_mid: 4,
            l_high: 8,
        };
        let levels = compute_levels(&h, n, &policy, 0, 10).unwrap();
        assert!(levels.iter().all(|&l| (1..=8).contains(&l)));
        assert_eq!(levels.first().copied(), Some(1));
        assert_eq!(levels.last().copied(), Some(8));
    }
}
