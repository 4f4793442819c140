//! Per-chunk occupancy emission (C3).
//!
//! [`emit_chunk`] turns one chunk's raw point cloud into a sparse map of
//! quantized grid keys to occupancy probabilities. Free-space marching
//! (when `origin` is set) is a straight-line voxel walk, not a physically
//! accurate ray tracer — the original system treats the actual sensor
//! model as an external black box and so does this one (§4.3, §9).
//!
//! Repeated hits/misses on the same voxel combine through the same stable
//! union used everywhere else in the crate, directly in probability
//! space — not a log-odds accumulator — which is what keeps two
//! coincident hits at `prob_hit = 0.7` combining to exactly `0.91`
//! (§8 scenario 2) rather than whatever a running log-odds sum would
//! produce.

use std::collections::HashMap;

use crate::hierarchy::Key;
use crate::union;
use crate::Probability;

/// The finest depth this module ever emits at, independent of how deep
/// the hierarchy later rolls things up. Exists purely so worker outputs
/// carry a depth value [`crate::hierarchy::Hierarchy::build`] can align
/// across workers that used different `emit_res` settings.
pub const OCCUPANCY_MAX_DEPTH: u16 = 20;

/// Parameters controlling one chunk's point-to-occupancy emission.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkParams {
    /// Voxel edge length points are quantized at.
    pub res: f64,
    /// Probability assigned to a voxel a point falls into.
    pub prob_hit: f64,
    /// Probability assigned to a voxel a ray passes through without
    /// stopping (only used when `origin` is set).
    pub prob_miss: f64,
    pub clamp_min: f64,
    pub clamp_max: f64,
    /// Sensor origin for free-space marching. `None` disables marching
    /// entirely, so only hit voxels are ever emitted.
    pub origin: Option<[f64; 3]>,
    /// Points farther than this from `origin` are dropped. Non-positive
    /// disables the range check.
    pub max_range: f64,
    /// Accepted for interface parity with the original sensor-model
    /// configuration; this emitter always evaluates eagerly.
    pub lazy_eval: bool,
    /// Accepted for interface parity; has no effect on a stub emitter
    /// that already only ever produces discrete voxel keys.
    pub discretize: bool,
    /// Coarser resolution to downsample hits/misses to before emitting,
    /// reducing key volume for dense point clouds. Non-positive (or
    /// smaller than `res`) disables downsampling.
    pub emit_res: f64,
    /// Upper bound on the emitted depth, independent of `emit_res`.
    /// Zero disables the cap (i.e. only [`OCCUPANCY_MAX_DEPTH`] applies).
    pub max_depth_cap: u16,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            res: 1.0,
            prob_hit: 0.7,
            prob_miss: 0.4,
            clamp_min: 0.12,
            clamp_max: 0.97,
            origin: None,
            max_range: -1.0,
            lazy_eval: false,
            discretize: false,
            emit_res: -1.0,
            max_depth_cap: 0,
        }
    }
}

/// One chunk's emitted occupancy map, plus the depth its keys are at.
#[derive(Debug, Clone, Default)]
pub struct WorkerOutput {
    pub td: u16,
    pub ptd: HashMap<Key, Probability>,
}

/// Turn a chunk's points into a sparse occupancy map.
pub fn emit_chunk(points: &[[f64; 3]], params: &ChunkParams) -> WorkerOutput {
    let (td, shift) = resolve_td(params);

    let mut hit_union: HashMap<Key, Probability> = HashMap::new();
    let mut visible: Vec<[f64; 3]> = Vec::with_capacity(points.len());
    for &p in points {
        if in_range(p, params) {
            visible.push(p);
            let key = downsample(quantize(p, params.res, params.discretize), shift);
            accumulate(&mut hit_union, key, params.prob_hit);
        }
    }

    let mut miss_union: HashMap<Key, Probability> = HashMap::new();
    if let Some(origin) = params.origin {
        for &p in &visible {
            for free_key in march_free_cells(origin, p, params.res, params.discretize, shift) {
                accumulate(&mut miss_union, free_key, params.prob_miss);
            }
        }
    }

    let mut ptd = HashMap::with_capacity(hit_union.len() + miss_union.len());
    for (&key, &hit) in hit_union.iter() {
        let miss = miss_union.get(&key).copied().unwrap_or(0.0);
        let combined = hit * (1.0 - miss);
        ptd.insert(key, combined.clamp(params.clamp_min, params.clamp_max));
    }
    for (&key, &miss) in miss_union.iter() {
        ptd.entry(key).or_insert_with(|| miss.clamp(params.clamp_min, params.clamp_max));
    }

    WorkerOutput { td, ptd }
}

fn accumulate(map: &mut HashMap<Key, Probability>, key: Key, p: Probability) {
    map.entry(key)
        .and_modify(|existing| *existing = union::union2(*existing, p, 0.5))
        .or_insert(p);
}

fn in_range(p: [f64; 3], params: &ChunkParams) -> bool {
    if params.max_range <= 0.0 {
        return true;
    }
    match params.origin {
        Some(origin) => distance(origin, p) <= params.max_range,
        None => true,
    }
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Quantize a world-space point into its finest-resolution grid key.
/// `discretize` selects `round` instead of the default `floor`, matching
/// the underlying engine's two quantization hints (§4.3). No centering
/// offset is applied, so negative coordinates wrap rather than bias-shift.
fn quantize(p: [f64; 3], res: f64, discretize: bool) -> Key {
    let axis = |v: f64| -> u32 {
        if res <= 0.0 {
            return 0;
        }
        let cell = v / res;
        let cell = if discretize { cell.round() } else { cell.floor() };
        (cell as i64) as u32
    };
    Key::new(axis(p[0]), axis(p[1]), axis(p[2]))
}

fn downsample(key: Key, shift: u32) -> Key {
    if shift == 0 {
        key
    } else {
        Key::new(key.x >> shift, key.y >> shift, key.z >> shift)
    }
}

/// The depth an emitted key is at, and how many bits finer keys get
/// shifted down by to reach it, derived from `emit_res` relative to
/// `res` (§4.3, §9).
fn resolve_td(params: &ChunkParams) -> (u16, u32) {
    let cap = if params.max_depth_cap > 0 {
        params.max_depth_cap.min(OCCUPANCY_MAX_DEPTH)
    } else {
        OCCUPANCY_MAX_DEPTH
    };
    let shift = if params.emit_res > 0.0 && params.res > 0.0 && params.emit_res > params.res {
        (params.emit_res / params.res).log2().round().max(0.0) as u32
    } else {
        0
    };
    (cap.saturating_sub(shift as u16), shift)
}

/// Walk the straight line from `origin` to `hit` in `res`-sized steps,
/// yielding every downsampled voxel key strictly before the final hit
/// voxel (so a hit voxel is never also recorded as a miss).
fn march_free_cells(origin: [f64; 3], hit: [f64; 3], res: f64, discretize: bool, shift: u32) -> Vec<Key> {
    if res <= 0.0 {
        return Vec::new();
    }
    let d = distance(origin, hit);
    if d <= res {
        return Vec::new();
    }
    let steps = (d / res).floor() as usize;
    let hit_key = downsample(quantize(hit, res, discretize), shift);

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for i in 0..steps {
        let t = i as f64 / steps as f64;
        let p = [
            origin[0] + (hit[0] - origin[0]) * t,
            origin[1] + (hit[1] - origin[1]) * t,
            origin[2] + (hit[2] - origin[2]) * t,
        ];
        let key = downsample(quantize(p, res, discretize), shift);
        if key == hit_key {
            continue;
        }
        if seen.insert(key) {
            out.push(key);
        }
    }
    out
}
