//! Octree forest materialization (C7).
//!
//! A [`Hierarchy`] is an abstract, backend-agnostic pile of probabilities;
//! a forest is what you get once that hierarchy has been carved into one
//! concrete octree per root tree of an `n`x`n`x`n` brick, refined to the
//! depth [`crate::policy`] picked for it and 2:1 balanced. Tree-local keys
//! come from [`hierarchy::split`]'s mod/div brick partitioning (§4.7):
//! `tree = key mod n`, `local = key div n`, so a root tree's member cells
//! are an interleaved subset of the global lattice rather than a
//! contiguous block. Refinement within a tree is gated per-quadrant on
//! whether any hierarchy leaf actually falls under that quadrant — a
//! dense, content-blind refine to the policy's chosen level would blow up
//! combinatorially for any non-trivial level, so this crate's reference
//! backend only ever splits a quadrant that has evidence, then widens
//! that to a forest-wide 2:1 balance pass afterward (§4.7 step 4, §9).
//! [`ForestBackend`] is the seam a real mesh library would sit behind;
//! [`InMemoryForest`] is the one implementation shipped here, since no
//! Rust binding to a real forest-of-octrees library exists to depend on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;

use crate::error::Error;
use crate::hierarchy::{self, Hierarchy, Key};
use crate::policy::{self, LevelPolicy};

/// Configuration for one [`build_forest`] call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForestConfig {
    /// The brick is partitioned into `n`x`n`x`n` root trees.
    pub n: usize,
    pub min_level: u16,
    pub max_level: u16,
    pub policy: LevelPolicy,
}

/// One leaf cell of a materialized forest.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LeafCell {
    pub tree_index: usize,
    /// The cell's key in the tree-local coordinate frame, at `depth`.
    pub key: Key,
    pub depth: u16,
    pub mean_prob: f64,
}

/// The seam a concrete octree-forest library sits behind.
///
/// `create_brick` allocates one tree's root; `refine_by_predicate` splits
/// cells while `should_refine` says yes; `balance` enforces the 2:1
/// neighbor constraint across the *whole* forest at once, since tree
/// boundaries participate in the same constraint as intra-tree ones;
/// `leaves` hands back one tree's resulting leaf cells with their stamped
/// user data.
pub trait ForestBackend {
    type Tree;

    fn create_brick(&self, tree_index: usize) -> Self::Tree;

    fn refine_by_predicate(&self, tree: &mut Self::Tree, target_level: u16, should_refine: &dyn Fn(Key, u16) -> bool);

    fn balance(&self, trees: &mut [Self::Tree]);

    fn leaves(&self, tree: &Self::Tree) -> Vec<LeafCell>;
}

/// A single tree's refinement state: the flat set of leaf cells reached
/// so far, each a `(key, depth)` pair in the tree-local frame.
#[derive(Debug, Clone)]
pub struct TreeState {
    tree_index: usize,
    cells: Vec<(Key, u16)>,
}

/// The only [`ForestBackend`] this crate ships: an in-process octree
/// forest held as plain Rust data structures, with no external library
/// underneath it. Snapshots the hierarchy's finest-depth leaves once, up
/// front, bucketed by tree and indexed by every depth's quadrant key, so
/// `has_evidence`/mean-probability lookups during refine and aggregation
/// don't repeatedly rescan the hierarchy.
pub struct InMemoryForest {
    grid_n: usize,
    td: u16,
    leaves_by_tree: Vec<Vec<(Key, f64)>>,
    evidence: Vec<HashSet<(u16, Key)>>,
}

impl InMemoryForest {
    pub fn new(hierarchy: &Hierarchy, grid_n: usize) -> Self {
        let n = grid_n.max(1);
        let num_trees = n * n * n;
        let td = hierarchy.finest_depth();

        let mut leaves_by_tree: Vec<Vec<(Key, f64)>> = vec![Vec::new(); num_trees];
        for (key, node) in hierarchy.nodes_at_depth(td) {
            if !node.is_leaf {
                continue;
            }
            let (tree, local) = hierarchy::split(key, n);
            let idx = hierarchy::tree_linear_index(tree, n);
            if idx < num_trees {
                leaves_by_tree[idx].push((local, node.probability));
            }
        }

        let evidence = leaves_by_tree.iter().map(|leaves| evidence_set(leaves, td)).collect();
        Self { grid_n: n, td, leaves_by_tree, evidence }
    }

    pub fn has_content(&self, tree_index: usize) -> bool {
        !self.leaves_by_tree[tree_index].is_empty()
    }

    /// Whether any hierarchy leaf's quadrant at `depth` equals `key`,
    /// within tree `tree_index`.
    pub fn has_evidence(&self, tree_index: usize, key: Key, depth: u16) -> bool {
        self.evidence[tree_index].contains(&(depth, key))
    }

    fn mean_prob(&self, tree_index: usize, key: Key, depth: u16) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for &(local, p) in &self.leaves_by_tree[tree_index] {
            if quadrant_at(local, self.td, depth) == key {
                sum += p;
                count += 1;
            }
        }
        if count > 0 {
            sum / count as f64
        } else {
            0.0
        }
    }
}

/// This local key's quadrant at a coarser `depth`, by right-shifting it
/// down from the hierarchy's finest depth `td` (§4.7 step 5's `local >>
/// shift`, `shift = td - depth`).
fn quadrant_at(local: Key, td: u16, depth: u16) -> Key {
    let shift = td.saturating_sub(depth);
    Key::new(local.x >> shift, local.y >> shift, local.z >> shift)
}

/// Every `(depth, quadrant)` pair any of `leaves` falls under, across
/// every depth from 0 to `td`. Built once per tree so repeated
/// `has_evidence` checks during refinement are O(1) set lookups.
fn evidence_set(leaves: &[(Key, f64)], td: u16) -> HashSet<(u16, Key)> {
    let mut set = HashSet::new();
    for &(local, _) in leaves {
        for depth in 0..=td {
            set.insert((depth, quadrant_at(local, td, depth)));
        }
    }
    set
}

/// This key's eight children one depth down, in the tree-local frame.
fn split_octants(key: Key) -> [Key; 8] {
    std::array::from_fn(|octant| {
        let octant = octant as u32;
        Key::new(key.x * 2 + (octant & 1), key.y * 2 + ((octant >> 1) & 1), key.z * 2 + ((octant >> 2) & 1))
    })
}

/// Split every current cell with `depth < new_target`, unconditionally
/// (no evidence check) — used only by the balance pass, which must be
/// able to deepen a quadrant purely to satisfy a neighbor's constraint.
fn force_refine(cells: &mut Vec<(Key, u16)>, new_target: u16) {
    loop {
        let mut next = Vec::with_capacity(cells.len());
        let mut changed = false;
        for &(key, depth) in cells.iter() {
            if depth < new_target {
                changed = true;
                for child in split_octants(key) {
                    next.push((child, depth + 1));
                }
            } else {
                next.push((key, depth));
            }
        }
        *cells = next;
        if !changed {
            break;
        }
    }
}

/// A cell's footprint in finest-depth (`td`) local units, as `(min, max)`
/// inclusive along each axis — used only to test adjacency between two
/// cells of the *same* tree, where both keys already share one
/// coordinate frame.
fn footprint(key: Key, depth: u16, td: u16) -> ([u32; 3], [u32; 3]) {
    let shift = td.saturating_sub(depth);
    let span = 1u32 << shift;
    let min = [key.x << shift, key.y << shift, key.z << shift];
    let max = [min[0] + span - 1, min[1] + span - 1, min[2] + span - 1];
    (min, max)
}

fn adjacent(a: ([u32; 3], [u32; 3]), b: ([u32; 3], [u32; 3])) -> bool {
    let (amin, amax) = a;
    let (bmin, bmax) = b;
    (0..3).all(|axis| {
        let expanded_lo = amin[axis].saturating_sub(1);
        let expanded_hi = amax[axis] + 1;
        expanded_lo <= bmax[axis] && bmin[axis] <= expanded_hi
    })
}

/// Split whichever of this tree's own cells are more than one depth
/// shallower than an adjacent cell, repeating until no pair violates the
/// 2:1 constraint. Intra-tree: adaptive, evidence-gated refinement can by
/// itself leave a depth-1 leaf next to a depth-3 one inside one tree.
fn intra_tree_balance(cells: &mut Vec<(Key, u16)>, td: u16) {
    loop {
        let footprints: Vec<([u32; 3], [u32; 3])> = cells.iter().map(|&(k, d)| footprint(k, d, td)).collect();
        let mut to_split: HashSet<usize> = HashSet::new();
        for i in 0..cells.len() {
            for j in 0..cells.len() {
                if i == j {
                    continue;
                }
                let (_, di) = cells[i];
                let (_, dj) = cells[j];
                if dj > di + 1 && adjacent(footprints[i], footprints[j]) {
                    to_split.insert(i);
                }
            }
        }
        if to_split.is_empty() {
            break;
        }
        let mut next = Vec::with_capacity(cells.len());
        for (idx, &(key, depth)) in cells.iter().enumerate() {
            if to_split.contains(&idx) {
                for child in split_octants(key) {
                    next.push((child, depth + 1));
                }
            } else {
                next.push((key, depth));
            }
        }
        *cells = next;
    }
}

fn unravel_tree(idx: usize, n: usize) -> (i64, i64, i64) {
    let n = n.max(1);
    ((idx % n) as i64, ((idx / n) % n) as i64, (idx / (n * n)) as i64)
}

fn neighbor_index(tx: i64, ty: i64, tz: i64, dx: i64, dy: i64, dz: i64, n: usize) -> Option<usize> {
    let (nx, ny, nz) = (tx + dx, ty + dy, tz + dz);
    let bound = n as i64;
    if nx < 0 || ny < 0 || nz < 0 || nx >= bound || ny >= bound || nz >= bound {
        return None;
    }
    Some(hierarchy::tree_linear_index((nx as u32, ny as u32, nz as u32), n))
}

impl ForestBackend for InMemoryForest {
    type Tree = TreeState;

    fn create_brick(&self, tree_index: usize) -> Self::Tree {
        TreeState { tree_index, cells: vec![(Key::new(0, 0, 0), 0)] }
    }

    fn refine_by_predicate(&self, tree: &mut Self::Tree, target_level: u16, should_refine: &dyn Fn(Key, u16) -> bool) {
        loop {
            let mut next = Vec::with_capacity(tree.cells.len());
            let mut changed = false;
            for &(key, depth) in &tree.cells {
                if depth < target_level && should_refine(key, depth) {
                    changed = true;
                    for child in split_octants(key) {
                        next.push((child, depth + 1));
                    }
                } else {
                    next.push((key, depth));
                }
            }
            tree.cells = next;
            if !changed {
                break;
            }
        }
    }

    /// Enforce the forest-wide 2:1 constraint across root-tree
    /// boundaries, treating each tree's current maximum cell depth as a
    /// scalar proxy for "how refined this tree is" (§4.7 step 4, §9):
    /// since a root tree's member cells are an interleaved, non-
    /// contiguous subset of the global lattice under the mod/div `split`
    /// partitioning, there is no single well-defined geometric boundary
    /// between two *different* trees' cells the way there is between two
    /// cells of the *same* tree — so cross-tree balance here widens a
    /// lagging neighbor tree uniformly rather than locally, a documented
    /// simplification appropriate to an in-memory reference backend.
    fn balance(&self, trees: &mut [Self::Tree]) {
        let n = self.grid_n;
        loop {
            let max_depth: Vec<u16> = trees.iter().map(|t| t.cells.iter().map(|&(_, d)| d).max().unwrap_or(0)).collect();
            let mut changed = false;
            for idx in 0..trees.len() {
                let (tx, ty, tz) = unravel_tree(idx, n);
                let mut required = max_depth[idx];
                for dx in -1..=1i64 {
                    for dy in -1..=1i64 {
                        for dz in -1..=1i64 {
                            if dx == 0 && dy == 0 && dz == 0 {
                                continue;
                            }
                            if let Some(neighbor) = neighbor_index(tx, ty, tz, dx, dy, dz, n) {
                                required = required.max(max_depth[neighbor].saturating_sub(1));
                            }
                        }
                    }
                }
                if required > max_depth[idx] {
                    force_refine(&mut trees[idx].cells, required);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for tree in trees.iter_mut() {
            intra_tree_balance(&mut tree.cells, self.td);
        }
    }

    fn leaves(&self, tree: &Self::Tree) -> Vec<LeafCell> {
        tree.cells
            .iter()
            .map(|&(key, depth)| LeafCell {
                tree_index: tree.tree_index,
                key,
                depth,
                mean_prob: self.mean_prob(tree.tree_index, key, depth),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ForestState {
    Uninitialized,
    Built(Vec<LeafCell>),
    Disposed,
}

/// An opaque, cheaply-cloned handle to a materialized forest.
///
/// Backed by a shared mutable state so repeated [`dispose_forest`] calls
/// on clones of the same handle (as the FFI boundary naturally produces)
/// are safe and idempotent rather than a double-free.
#[derive(Debug, Clone)]
pub struct ForestHandle {
    state: Arc<Mutex<ForestState>>,
}

impl ForestHandle {
    fn new(leaves: Vec<LeafCell>) -> Self {
        Self { state: Arc::new(Mutex::new(ForestState::Built(leaves))) }
    }

    /// All leaves across every tree, or `None` if the handle has been
    /// disposed.
    pub fn leaves(&self) -> Option<Vec<LeafCell>> {
        match &*self.state.lock().expect("forest handle lock poisoned") {
            ForestState::Built(leaves) => Some(leaves.clone()),
            ForestState::Uninitialized | ForestState::Disposed => None,
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(&*self.state.lock().expect("forest handle lock poisoned"), ForestState::Disposed)
    }
}

/// Materialize a forest: pick a level per tree, adaptively refine where
/// the hierarchy has evidence, balance 2:1 across the whole forest, and
/// stamp each resulting leaf with its quadrant's mean probability (§4.7).
///
/// Per-tree refinement runs in parallel via `rayon` (independent work,
/// one tree per task); the cross-tree balance pass that follows is
/// inherently sequential since it reads every tree's state at once.
pub fn build_forest(hierarchy: &Hierarchy, config: ForestConfig) -> Result<ForestHandle, Error> {
    if config.n == 0 {
        return Err(Error::InvalidInput("forest n must be at least 1".to_string()));
    }
    if config.min_level > config.max_level {
        return Err(Error::InvalidInput(format!(
            "min_level {} exceeds max_level {}",
            config.min_level, config.max_level
        )));
    }

    let levels = policy::compute_levels(hierarchy, config.n, &config.policy, config.min_level, config.max_level)?;
    let backend = InMemoryForest::new(hierarchy, config.n);
    let num_trees = config.n * config.n * config.n;

    let mut trees: Vec<TreeState> = (0..num_trees)
        .into_par_iter()
        .map(|tree_index| {
            let mut tree = backend.create_brick(tree_index);
            let target = if backend.has_content(tree_index) { levels[tree_index] } else { 0 };
            backend.refine_by_predicate(&mut tree, target, &|key, depth| backend.has_evidence(tree_index, key, depth));
            intra_tree_balance(&mut tree.cells, backend.td);
            tree
        })
        .collect();

    backend.balance(&mut trees);

    let all_leaves: Vec<LeafCell> = trees.par_iter().flat_map(|tree| backend.leaves(tree)).collect();
    Ok(ForestHandle::new(all_leaves))
}

/// Release a forest's backend resources. Safe to call more than once on
/// clones of the same handle; every call after the first is a no-op.
pub fn dispose_forest(handle: ForestHandle) {
    let mut state = handle.state.lock().expect("forest handle lock poisoned");
    *state = ForestState::Disposed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupancy::WorkerOutput;
    use std::collections::HashMap as StdHashMap;

    fn dense_hierarchy() -> Hierarchy {
        let td = 3u16;
        let mut ptd = StdHashMap::new();
        for x in 0..(1u32 << td) {
            ptd.insert(Key::new(x, 0, 0), 0.9);
        }
        let outputs = vec![WorkerOutput { td, ptd }];
        Hierarchy::build(&outputs, 0.0, false, 0.5, 0).unwrap()
    }

    #[test]
    fn build_forest_rejects_zero_n() {
        let h = dense_hierarchy();
        let config = ForestConfig { n: 0, min_level: 0, max_level: 2, policy: LevelPolicy::Uniform(1) };
        assert!(matches!(build_forest(&h, config), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn build_forest_produces_leaves() {
        let h = dense_hierarchy();
        let config = ForestConfig { n: 1, min_level: 0, max_level: 3, policy: LevelPolicy::Uniform(3) };
        let handle = build_forest(&h, config).unwrap();
        let leaves = handle.leaves().unwrap();
        assert!(!leaves.is_empty());
    }

    #[test]
    fn dispose_is_idempotent_across_clones() {
        let h = dense_hierarchy();
        let config = ForestConfig { n: 1, min_level: 0, max_level: 1, policy: LevelPolicy::Uniform(1) };
        let handle = build_forest(&h, config).unwrap();
        let clone = handle.clone();
        dispose_forest(handle);
        assert!(clone.is_disposed());
        assert!(clone.leaves().is_none());
        dispose_forest(clone.clone());
        assert!(clone.is_disposed());
    }

    #[test]
    fn intra_tree_balance_keeps_neighboring_leaf_depths_within_one() {
        let h = dense_hierarchy();
        let config = ForestConfig { n: 1, min_level: 0, max_level: 3, policy: LevelPolicy::Uniform(3) };
        let handle = build_forest(&h, config).unwrap();
        let leaves = handle.leaves().unwrap();
        let td = h.finest_depth();
        for a in &leaves {
            for b in &leaves {
                if a.key == b.key && a.depth == b.depth {
                    continue;
                }
                let fa = footprint(a.key, a.depth, td);
                let fb = footprint(b.key, b.depth, td);
                if adjacent(fa, fb) {
                    assert!((a.depth as i32 - b.depth as i32).abs() <= 1);
                }
            }
        }
    }

    #[test]
    fn cross_tree_balance_raises_shallow_neighbors() {
        // One hierarchy leaf along the (even, even, even) lattice point
        // so it lands in tree (0,0,0) under split()'s mod/div scheme;
        // every other tree of the n=2 brick starts with zero content.
        let td = 3u16;
        let mut ptd = StdHashMap::new();
        ptd.insert(Key::new(0, 0, 0), 0.9);
        let outputs = vec![WorkerOutput { td, ptd }];
        let h = Hierarchy::build(&outputs, 0.0, false, 0.5, 0).unwrap();

        let config = ForestConfig {
            n: 2,
            min_level: 0,
            max_level: 3,
            policy: LevelPolicy::Explicit(vec![3, 0, 0, 0, 0, 0, 0, 0]),
        };
        let handle = build_forest(&h, config).unwrap();
        let leaves = handle.leaves().unwrap();

        let max_depth_of = |tree_index: usize| {
            leaves.iter().filter(|l| l.tree_index == tree_index).map(|l| l.depth).max().unwrap_or(0)
        };
        assert_eq!(max_depth_of(0), 3);
        for t in 1..8 {
            assert!(max_depth_of(t) >= 2, "tree {t} should have balanced up to depth >= 2, got {}", max_depth_of(t));
        }
    }
}
