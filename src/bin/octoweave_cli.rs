//! `octoweave-cli`: drives the library's three-stage pipeline end-to-end
//! from the command line — build a hierarchy from a point CSV, materialize
//! a forest from that hierarchy under a chosen level policy, and render a
//! forest as a PGM slice or SVG depth histogram.
//!
//! A thin wrapper around the library: parse arguments, call into the
//! crate, report errors with `anyhow`, exit non-zero on failure.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use octoweave::forest::LeafCell;
use octoweave::hierarchy::Key;
use octoweave::{occupancy, ChunkParams, Hierarchy, Probability};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// log verbosity: off, error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    verbosity: log::LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a hierarchy from a point CSV (`x,y,z` rows, no header) and
    /// write its finest-depth leaves out as `x,y,z,depth,prob` rows.
    Build {
        #[arg(long)]
        points: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 1.0)]
        res: f64,
        #[arg(long, default_value_t = 0.7)]
        prob_hit: Probability,
        #[arg(long, default_value_t = 0.4)]
        prob_miss: Probability,
        #[arg(long, default_value_t = 0.9)]
        tau: f64,
        #[arg(long, default_value_t = false)]
        use_logodds: bool,
        #[arg(long, default_value_t = 0.5)]
        p_unknown: Probability,
        #[arg(long, default_value_t = 0)]
        base_depth: u16,
    },
    /// Materialize a forest from a hierarchy leaves CSV under a uniform
    /// per-tree refinement level, and write the forest's leaves out.
    Forest {
        #[arg(long)]
        hierarchy: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 1)]
        n: usize,
        #[arg(long, default_value_t = 0)]
        min_level: u16,
        #[arg(long, default_value_t = 8)]
        max_level: u16,
        #[arg(long, default_value_t = 4)]
        level: u16,
        #[arg(long, default_value_t = 0.0)]
        tau: f64,
        #[arg(long, default_value_t = false)]
        use_logodds: bool,
        #[arg(long, default_value_t = 0.5)]
        p_unknown: Probability,
    },
    /// Render a forest leaves CSV as a PGM slice or an SVG depth histogram.
    Viz {
        #[arg(long)]
        leaves: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// "pgm" or "svg"
        #[arg(long, default_value = "svg")]
        kind: String,
        #[arg(long, default_value_t = 0)]
        z: u32,
        /// only leaves at exactly this depth are rendered
        #[arg(long, default_value_t = 0)]
        depth: u16,
        #[arg(long, default_value_t = 0)]
        min_x: u32,
        #[arg(long, default_value_t = 0)]
        min_y: u32,
        #[arg(long, default_value_t = 64)]
        max_x: u32,
        #[arg(long, default_value_t = 64)]
        max_y: u32,
        #[arg(long, default_value_t = 64)]
        width: usize,
        #[arg(long, default_value_t = 64)]
        height: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    octoweave::init_logging(cli.verbosity);

    match cli.command {
        Command::Build { points, out, res, prob_hit, prob_miss, tau, use_logodds, p_unknown, base_depth } => {
            run_build(points, out, res, prob_hit, prob_miss, tau, use_logodds, p_unknown, base_depth)
        }
        Command::Forest { hierarchy, out, n, min_level, max_level, level, tau, use_logodds, p_unknown } => {
            run_forest(hierarchy, out, n, min_level, max_level, level, tau, use_logodds, p_unknown)
        }
        Command::Viz { leaves, out, kind, z, depth, min_x, min_y, max_x, max_y, width, height } => {
            run_viz(leaves, out, &kind, z, depth, (min_x, min_y), (max_x, max_y), width, height)
        }
    }
}

fn read_points(path: &PathBuf) -> anyhow::Result<Vec<[f64; 3]>> {
    let file = File::open(path).map_err(|e| anyhow::anyhow!("open points file {}: {}", path.display(), e))?;
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(BufReader::new(file));
    let mut points = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| anyhow::anyhow!("read points row: {}", e))?;
        if record.len() != 3 {
            return Err(anyhow::anyhow!("expected 3 csv fields per point, got {}", record.len()));
        }
        let parse = |i: usize| -> anyhow::Result<f64> {
            record.get(i).ok_or_else(|| anyhow::anyhow!("missing point field {i}"))?.parse::<f64>().map_err(|e| anyhow::anyhow!("bad point field {i}: {e}"))
        };
        points.push([parse(0)?, parse(1)?, parse(2)?]);
    }
    Ok(points)
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    points_path: PathBuf,
    out: PathBuf,
    res: f64,
    prob_hit: Probability,
    prob_miss: Probability,
    tau: f64,
    use_logodds: bool,
    p_unknown: Probability,
    base_depth: u16,
) -> anyhow::Result<()> {
    let points = read_points(&points_path)?;
    let params = ChunkParams {
        res,
        prob_hit,
        prob_miss,
        clamp_min: 0.01,
        clamp_max: 0.99,
        origin: None,
        max_range: -1.0,
        lazy_eval: false,
        discretize: true,
        emit_res: -1.0,
        max_depth_cap: 0,
    };

    let progress = octoweave::progress(1);
    let output = occupancy::emit_chunk(&points, &params);
    progress.finish_and_clear();

    let hierarchy = Hierarchy::build(&[output], tau, use_logodds, p_unknown, base_depth)
        .map_err(|e| anyhow::anyhow!("build hierarchy: {}", e))?;

    let leaves = hierarchy_to_leaves(&hierarchy);
    let file = File::create(&out).map_err(|e| anyhow::anyhow!("create {}: {}", out.display(), e))?;
    octoweave::csvio::write_leaves(BufWriter::new(file), &leaves).map_err(|e| anyhow::anyhow!("write leaves: {}", e))?;
    log::info!("wrote {} hierarchy leaves to {}", leaves.len(), out.display());
    Ok(())
}

fn hierarchy_to_leaves(hierarchy: &Hierarchy) -> Vec<LeafCell> {
    let td = hierarchy.finest_depth();
    hierarchy
        .nodes_at_depth(td)
        .filter(|(_, node)| node.is_leaf)
        .map(|(key, node)| LeafCell { tree_index: 0, key, depth: td, mean_prob: node.probability })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn run_forest(
    hierarchy_path: PathBuf,
    out: PathBuf,
    n: usize,
    min_level: u16,
    max_level: u16,
    level: u16,
    tau: f64,
    use_logodds: bool,
    p_unknown: Probability,
) -> anyhow::Result<()> {
    let file = File::open(&hierarchy_path).map_err(|e| anyhow::anyhow!("open {}: {}", hierarchy_path.display(), e))?;
    let rows = octoweave::csvio::read_leaves(BufReader::new(file)).map_err(|e| anyhow::anyhow!("read hierarchy leaves: {}", e))?;
    let td = rows.iter().map(|row| row.depth).max().unwrap_or(0);
    let mut ptd: std::collections::HashMap<Key, Probability> = std::collections::HashMap::new();
    for row in rows {
        ptd.insert(row.key, row.mean_prob);
    }
    let output = octoweave::WorkerOutput { td, ptd };
    let hierarchy =
        Hierarchy::build(&[output], tau, use_logodds, p_unknown, 0).map_err(|e| anyhow::anyhow!("rebuild hierarchy: {}", e))?;

    let config = octoweave::ForestConfig { n, min_level, max_level, policy: octoweave::LevelPolicy::Uniform(level) };
    let handle = octoweave::build_forest(&hierarchy, config).map_err(|e| anyhow::anyhow!("build forest: {}", e))?;
    let leaves = handle.leaves().unwrap_or_default();

    let file = File::create(&out).map_err(|e| anyhow::anyhow!("create {}: {}", out.display(), e))?;
    octoweave::csvio::write_leaves(BufWriter::new(file), &leaves).map_err(|e| anyhow::anyhow!("write leaves: {}", e))?;
    log::info!("wrote {} forest leaves to {}", leaves.len(), out.display());
    octoweave::dispose_forest(handle);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_viz(
    leaves_path: PathBuf,
    out: PathBuf,
    kind: &str,
    z: u32,
    depth: u16,
    min_xy: (u32, u32),
    max_xy: (u32, u32),
    width: usize,
    height: usize,
) -> anyhow::Result<()> {
    let file = File::open(&leaves_path).map_err(|e| anyhow::anyhow!("open {}: {}", leaves_path.display(), e))?;
    let leaves = octoweave::csvio::read_leaves(BufReader::new(file)).map_err(|e| anyhow::anyhow!("read leaves: {}", e))?;
    let out_file = File::create(&out).map_err(|e| anyhow::anyhow!("create {}: {}", out.display(), e))?;
    let mut writer = BufWriter::new(out_file);

    match kind {
        "pgm" => octoweave::viz::write_pgm_slice(&mut writer, &leaves, z, depth, min_xy, max_xy, width, height)
            .map_err(|e| anyhow::anyhow!("write pgm: {}", e))?,
        "svg" => octoweave::viz::write_depth_histogram_svg(&mut writer, &leaves).map_err(|e| anyhow::anyhow!("write svg: {}", e))?,
        other => return Err(anyhow::anyhow!("unknown viz kind '{other}', expected 'pgm' or 'svg'")),
    }
    log::info!("wrote {kind} visualization to {}", out.display());
    Ok(())
}
