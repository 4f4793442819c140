//! `octoweave` builds a sparse probabilistic occupancy hierarchy over a
//! uniform brick-partitioned domain from per-chunk point clouds, and
//! materializes that hierarchy into a forest of octrees whose per-tree
//! refinement level is chosen by a configurable policy.
//!
//! The pipeline is a straight line: [`chunk`] partitions the world,
//! [`occupancy`] turns one chunk's points into a sparse probability map,
//! [`parallel`] runs that per-chunk step across chunks deterministically,
//! [`hierarchy`] rolls the per-chunk maps up into one sparse tree, [`policy`]
//! picks a refinement level per root tree, and [`forest`] materializes the
//! result. [`csvio`], [`viz`] and [`ffi`] are collaborators built on top of
//! that core, not part of it.

pub mod chunk;
pub mod csvio;
pub mod error;
pub mod ffi;
pub mod forest;
pub mod hierarchy;
pub mod occupancy;
pub mod parallel;
pub mod policy;
pub mod union;
pub mod viz;

pub use chunk::Aabb;
pub use chunk::ChunkGrid;
pub use error::Error;
pub use forest::ForestConfig;
pub use forest::ForestHandle;
pub use hierarchy::Hierarchy;
pub use hierarchy::Key;
pub use hierarchy::NdKey;
pub use hierarchy::Node;
pub use occupancy::ChunkParams;
pub use occupancy::WorkerOutput;
pub use policy::LevelPolicy;

/// dimensional analysis types
pub type Probability = f64;

/// keys are 32-bit, but §7 caps the implementation at depth 30.
pub const MAX_DEPTH: u16 = 30;

/// Build a hierarchy from already-chunked points.
///
/// Runs [`occupancy::emit_chunk`] over every chunk via the deterministic
/// [`parallel::build_workers`] driver, then rolls the resulting worker
/// outputs up through [`hierarchy::Hierarchy::build`].
pub fn build_hierarchy(
    chunks: &[Vec<[f64; 3]>],
    params: &ChunkParams,
    tau: f64,
    use_logodds: bool,
    p_unknown: Probability,
    base_depth: u16,
) -> Result<Hierarchy, Error> {
    let outputs = parallel::build_workers(chunks.len(), 0, |i| occupancy::emit_chunk(&chunks[i], params));
    Hierarchy::build(&outputs, tau, use_logodds, p_unknown, base_depth)
}

/// Compute per-tree target refinement levels for an `n`x`n`x`n` brick.
pub fn compute_levels(
    hierarchy: &Hierarchy,
    n: usize,
    policy: &LevelPolicy,
    min_level: u16,
    max_level: u16,
) -> Result<Vec<u16>, Error> {
    policy::compute_levels(hierarchy, n, policy, min_level, max_level)
}

/// Materialize a forest from a hierarchy under the given configuration.
///
/// Leaves no allocated backend state behind on failure (§4.7, §7).
pub fn build_forest(hierarchy: &Hierarchy, config: ForestConfig) -> Result<ForestHandle, Error> {
    forest::build_forest(hierarchy, config)
}

/// Release a forest's backend resources. Idempotent; never fails.
pub fn dispose_forest(handle: ForestHandle) {
    forest::dispose_forest(handle)
}

/// initialize logging for the CLI front-end
#[cfg(feature = "cli")]
pub fn init_logging(verbosity: log::LevelFilter) {
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let term = simplelog::TermLogger::new(
        verbosity,
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    simplelog::CombinedLogger::init(vec![term]).expect("initialize logger");
}

/// progress bar matching the CLI's long-running stages
#[cfg(feature = "cli")]
pub fn progress(n: usize) -> indicatif::ProgressBar {
    let tick = std::time::Duration::from_millis(200);
    let style = "{spinner:.cyan} {elapsed} ~ {percent:>3}% {wide_bar:.cyan} {pos}/{len}";
    let style = indicatif::ProgressStyle::with_template(style).expect("valid progress template");
    let bar = indicatif::ProgressBar::new(n as u64);
    bar.set_style(style);
    bar.enable_steady_tick(tick);
    bar
}
