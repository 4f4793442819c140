//! Visualization collaborators: a grayscale PGM slice through a forest
//! and an SVG histogram of leaf depths, both grounded on the original
//! plotting routines (§6).

use std::collections::BTreeMap;
use std::io::Write;

use crate::error::Error;
use crate::forest::LeafCell;

/// Write a grayscale PGM (P2, plain-text) slice at `z` and `depth`
/// through the leaves, sampling a `width`x`height` grid over
/// `[min_xy, max_xy)`. Each pixel takes the probability of whichever
/// leaf at exactly `depth` contains its sample point, or 0 if none does
/// — a materialized forest mixes leaves at different depths from
/// adaptive refine and 2:1 balance, so a slice that didn't filter on
/// depth would conflate cells at different refinement levels (§6,
/// `original_source/src/viz/viz_impl.cpp`'s `r.d==depth && r.z==slice_z`
/// filter).
pub fn write_pgm_slice<W: Write>(
    mut writer: W,
    leaves: &[LeafCell],
    z: u32,
    depth: u16,
    min_xy: (u32, u32),
    max_xy: (u32, u32),
    width: usize,
    height: usize,
) -> Result<(), Error> {
    writeln!(writer, "P2")?;
    writeln!(writer, "{width} {height}")?;
    writeln!(writer, "255")?;

    let slice: Vec<&LeafCell> =
        leaves.iter().filter(|leaf| leaf.depth == depth && leaf_contains_z(leaf, z)).collect();

    let (min_x, min_y) = min_xy;
    let (max_x, max_y) = max_xy;
    let span_x = (max_x.saturating_sub(min_x)).max(1) as f64;
    let span_y = (max_y.saturating_sub(min_y)).max(1) as f64;

    for row in 0..height {
        let mut line = String::new();
        for col in 0..width {
            let sample_x = min_x as f64 + (col as f64 + 0.5) / width as f64 * span_x;
            let sample_y = min_y as f64 + (row as f64 + 0.5) / height as f64 * span_y;
            let prob = slice
                .iter()
                .find(|leaf| leaf_contains_xy(leaf, sample_x as u32, sample_y as u32))
                .map(|leaf| leaf.mean_prob)
                .unwrap_or(0.0);
            let gray = (prob.clamp(0.0, 1.0) * 255.0).round() as u32;
            if col > 0 {
                line.push(' ');
            }
            line.push_str(&gray.to_string());
        }
        writeln!(writer, "{line}")?;
    }
    Ok(())
}

/// Leaves are stored in tree-local units, one unit per cell at the
/// leaf's own depth, so every leaf's footprint is exactly 1 unit wide.
fn leaf_cell_span(_leaf: &LeafCell) -> u32 {
    1
}

fn leaf_contains_z(leaf: &LeafCell, z: u32) -> bool {
    let span = leaf_cell_span(leaf);
    z >= leaf.key.z && z < leaf.key.z + span
}

fn leaf_contains_xy(leaf: &LeafCell, x: u32, y: u32) -> bool {
    let span = leaf_cell_span(leaf);
    x >= leaf.key.x && x < leaf.key.x + span && y >= leaf.key.y && y < leaf.key.y + span
}

/// Write an SVG bar-chart histogram of leaf counts by depth, with one
/// `<!-- depth D: count N -->` comment per bar so the raw counts survive
/// alongside the rendering.
pub fn write_depth_histogram_svg<W: Write>(mut writer: W, leaves: &[LeafCell]) -> Result<(), Error> {
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for leaf in leaves {
        *counts.entry(leaf.depth).or_insert(0) += 1;
    }

    let bar_width = 40;
    let gap = 10;
    let max_height = 200;
    let width = counts.len().max(1) * (bar_width + gap) + gap;
    let max_count = counts.values().copied().max().unwrap_or(1).max(1);

    writeln!(writer, r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{}">"#, max_height + 40)?;
    for (i, (&depth, &count)) in counts.iter().enumerate() {
        writeln!(writer, "  <!-- depth {depth}: count {count} -->")?;
        let bar_height = (count as f64 / max_count as f64 * max_height as f64).round() as usize;
        let x = gap + i * (bar_width + gap);
        let y = max_height - bar_height;
        writeln!(
            writer,
            r#"  <rect x="{x}" y="{y}" width="{bar_width}" height="{bar_height}" fill="steelblue" />"#
        )?;
        writeln!(
            writer,
            r#"  <text x="{}" y="{}" font-size="10" text-anchor="middle">{depth}</text>"#,
            x + bar_width / 2,
            max_height + 15
        )?;
    }
    writeln!(writer, "</svg>")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::Key;

    fn leaf(x: u32, y: u32, z: u32, depth: u16, prob: f64) -> LeafCell {
        LeafCell { tree_index: 0, key: Key::new(x, y, z), depth, mean_prob: prob }
    }

    #[test]
    fn pgm_has_correct_header_and_dimensions() {
        let leaves = vec![leaf(0, 0, 0, 1, 0.8)];
        let mut buf = Vec::new();
        write_pgm_slice(&mut buf, &leaves, 0, 1, (0, 0), (4, 4), 4, 4).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("P2"));
        assert_eq!(lines.next(), Some("4 4"));
        assert_eq!(lines.next(), Some("255"));
        assert_eq!(lines.count(), 4);
    }

    #[test]
    fn pgm_slice_ignores_leaves_at_other_depths() {
        // A depth-1 leaf sits at the same (x, y, z) as a depth-2 leaf
        // would occupy, but only the requested depth's evidence may
        // light up a pixel.
        let leaves = vec![leaf(0, 0, 0, 2, 0.9)];
        let mut buf = Vec::new();
        write_pgm_slice(&mut buf, &leaves, 0, 1, (0, 0), (2, 2), 2, 2).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let pixels: Vec<&str> = text.lines().skip(3).flat_map(|line| line.split(' ')).collect();
        assert!(pixels.iter().all(|&p| p == "0"), "expected no pixels lit, got {pixels:?}");
    }

    #[test]
    fn histogram_embeds_depth_count_comments() {
        let leaves = vec![leaf(0, 0, 0, 1, 0.5), leaf(1, 0, 0, 1, 0.5), leaf(0, 1, 0, 2, 0.5)];
        let mut buf = Vec::new();
        write_depth_histogram_svg(&mut buf, &leaves).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("<!-- depth 1: count 2 -->"));
        assert!(text.contains("<!-- depth 2: count 1 -->"));
        assert!(text.starts_with("<svg"));
    }

    #[test]
    fn empty_forest_still_produces_valid_svg() {
        let mut buf = Vec::new();
        write_depth_histogram_svg(&mut buf, &[]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("<svg"));
        assert!(text.trim_end().ends_with("</svg>"));
    }
}
