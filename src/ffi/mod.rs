//! A C-ABI surface over [`ForestHandle`] (§6).
//!
//! This is the one place in the crate where `unsafe` is justified: every
//! other module speaks in owned Rust values, but a C caller can only
//! hand back an opaque pointer it received from us, so these functions
//! must trust that pointer came from [`octoweave_forest_build`] and
//! hasn't already been freed.

use std::os::raw::c_int;

use crate::forest::{build_forest, dispose_forest, ForestConfig, ForestHandle};
use crate::hierarchy::Hierarchy;
use crate::policy::LevelPolicy;

/// An opaque handle returned to C callers. Boxing the [`ForestHandle`]
/// gives it a stable address; the `ForestHandle` itself is cheap to
/// clone internally, so disposing this box never double-frees the
/// forest state it points to.
pub struct OctoweaveForest(ForestHandle);

/// Build a forest with a uniform per-tree level and return an opaque
/// handle, or a null pointer on failure.
///
/// # Safety
/// `hierarchy` must point to a live [`Hierarchy`] owned by the caller
/// for at least the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn octoweave_forest_build_uniform(
    hierarchy: *const Hierarchy,
    n: usize,
    min_level: u16,
    max_level: u16,
    uniform_level: u16,
) -> *mut OctoweaveForest {
    if hierarchy.is_null() {
        return std::ptr::null_mut();
    }
    let hierarchy = &*hierarchy;
    let config = ForestConfig { n, min_level, max_level, policy: LevelPolicy::Uniform(uniform_level) };
    match build_forest(hierarchy, config) {
        Ok(handle) => Box::into_raw(Box::new(OctoweaveForest(handle))),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Number of leaves in a built forest, or `-1` if `forest` is null or
/// already disposed.
///
/// # Safety
/// `forest` must be either null or a pointer returned by
/// [`octoweave_forest_build_uniform`] that hasn't been passed to
/// [`octoweave_forest_dispose`] yet.
#[no_mangle]
pub unsafe extern "C" fn octoweave_forest_leaf_count(forest: *const OctoweaveForest) -> c_int {
    if forest.is_null() {
        return -1;
    }
    match (*forest).0.leaves() {
        Some(leaves) => leaves.len() as c_int,
        None => -1,
    }
}

/// Copy leaf `index`'s `(x, y, z, depth, prob)` into the caller's
/// out-parameters. Returns `0` on success, `-1` if `forest` is null,
/// disposed, or `index` is out of range.
///
/// # Safety
/// `forest` must satisfy the same contract as in
/// [`octoweave_forest_leaf_count`]; `out_x`, `out_y`, `out_z`,
/// `out_depth`, and `out_prob` must each point to writable storage of
/// the matching type.
#[no_mangle]
pub unsafe extern "C" fn octoweave_forest_get_leaf(
    forest: *const OctoweaveForest,
    index: usize,
    out_x: *mut u32,
    out_y: *mut u32,
    out_z: *mut u32,
    out_depth: *mut u16,
    out_prob: *mut f64,
) -> c_int {
    if forest.is_null() {
        return -1;
    }
    let leaves = match (*forest).0.leaves() {
        Some(leaves) => leaves,
        None => return -1,
    };
    let Some(leaf) = leaves.get(index) else {
        return -1;
    };
    if !out_x.is_null() {
        *out_x = leaf.key.x;
    }
    if !out_y.is_null() {
        *out_y = leaf.key.y;
    }
    if !out_z.is_null() {
        *out_z = leaf.key.z;
    }
    if !out_depth.is_null() {
        *out_depth = leaf.depth;
    }
    if !out_prob.is_null() {
        *out_prob = leaf.mean_prob;
    }
    0
}

/// Release a forest's backend state and the handle box itself. Safe to
/// call with a null pointer (a no-op); never call twice on the same
/// pointer value, since the box itself is freed here even though the
/// underlying forest state would tolerate it.
///
/// # Safety
/// `forest` must be either null or a pointer returned by
/// [`octoweave_forest_build_uniform`] that hasn't already been passed to
/// this function.
#[no_mangle]
pub unsafe extern "C" fn octoweave_forest_dispose(forest: *mut OctoweaveForest) {
    if forest.is_null() {
        return;
    }
    let boxed = Box::from_raw(forest);
    dispose_forest(boxed.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupancy::WorkerOutput;
    use std::collections::HashMap;

    fn sample_hierarchy() -> Hierarchy {
        let td = 2u16;
        let mut ptd = HashMap::new();
        ptd.insert(crate::hierarchy::Key::new(0, 0, 0), 0.9);
        ptd.insert(crate::hierarchy::Key::new(1, 1, 1), 0.8);
        let outputs = vec![WorkerOutput { td, ptd }];
        Hierarchy::build(&outputs, 0.0, false, 0.5, 0).unwrap()
    }

    #[test]
    fn build_leaf_count_and_dispose_round_trip() {
        let hierarchy = sample_hierarchy();
        unsafe {
            let forest = octoweave_forest_build_uniform(&hierarchy, 1, 0, 2, 2);
            assert!(!forest.is_null());
            let count = octoweave_forest_leaf_count(forest);
            assert!(count > 0);

            let mut x = 0u32;
            let mut y = 0u32;
            let mut z = 0u32;
            let mut depth = 0u16;
            let mut prob = 0.0f64;
            let ok = octoweave_forest_get_leaf(forest, 0, &mut x, &mut y, &mut z, &mut depth, &mut prob);
            assert_eq!(ok, 0);

            octoweave_forest_dispose(forest);
        }
    }

    #[test]
    fn null_handle_is_rejected_everywhere() {
        unsafe {
            assert_eq!(octoweave_forest_leaf_count(std::ptr::null()), -1);
            assert_eq!(
                octoweave_forest_get_leaf(
                    std::ptr::null(),
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut()
                ),
                -1
            );
            octoweave_forest_dispose(std::ptr::null_mut());
        }
    }
}
