//! CSV persistence for materialized forest leaves.
//!
//! The only on-disk artifact this crate writes: `x,y,z,depth,prob`, one
//! row per leaf, no header, in whatever order the forest produced them
//! in (§6).

use std::io::{Read, Write};

use crate::error::Error;
use crate::forest::LeafCell;
use crate::hierarchy::Key;

/// Write every leaf to `writer` as `x,y,z,depth,prob` rows, no header.
pub fn write_leaves<W: Write>(writer: W, leaves: &[LeafCell]) -> Result<(), Error> {
    let mut csv_writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    for leaf in leaves {
        csv_writer
            .write_record(&[
                leaf.key.x.to_string(),
                leaf.key.y.to_string(),
                leaf.key.z.to_string(),
                leaf.depth.to_string(),
                leaf.mean_prob.to_string(),
            ])
            .map_err(csv_error)?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Read back rows previously written by [`write_leaves`]. `tree_index`
/// is not part of the CSV format, so every returned cell is tagged `0`;
/// callers that wrote a multi-tree forest are expected to track tree
/// boundaries themselves if they need them back.
pub fn read_leaves<R: Read>(reader: R) -> Result<Vec<LeafCell>, Error> {
    let mut csv_reader = csv::ReaderBuilder::new().has_headers(false).from_reader(reader);
    let mut leaves = Vec::new();
    for record in csv_reader.records() {
        let record = record.map_err(csv_error)?;
        if record.len() != 5 {
            return Err(Error::InvalidInput(format!("expected 5 csv fields, got {}", record.len())));
        }
        let field = |i: usize| -> Result<&str, Error> {
            record.get(i).ok_or_else(|| Error::InvalidInput(format!("missing csv field {i}")))
        };
        let x: u32 = field(0)?.parse().map_err(|_| Error::InvalidInput("bad x field".to_string()))?;
        let y: u32 = field(1)?.parse().map_err(|_| Error::InvalidInput("bad y field".to_string()))?;
        let z: u32 = field(2)?.parse().map_err(|_| Error::InvalidInput("bad z field".to_string()))?;
        let depth: u16 = field(3)?.parse().map_err(|_| Error::InvalidInput("bad depth field".to_string()))?;
        let prob: f64 = field(4)?.parse().map_err(|_| Error::InvalidInput("bad prob field".to_string()))?;
        leaves.push(LeafCell { tree_index: 0, key: Key::new(x, y, z), depth, mean_prob: prob });
    }
    Ok(leaves)
}

fn csv_error(e: csv::Error) -> Error {
    Error::InvalidInput(format!("csv error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_leaves() {
        let leaves = vec![
            LeafCell { tree_index: 0, key: Key::new(1, 2, 3), depth: 4, mean_prob: 0.875 },
            LeafCell { tree_index: 0, key: Key::new(0, 0, 0), depth: 0, mean_prob: 0.5 },
        ];
        let mut buf = Vec::new();
        write_leaves(&mut buf, &leaves).unwrap();
        let read_back = read_leaves(buf.as_slice()).unwrap();
        assert_eq!(read_back.len(), leaves.len());
        assert_eq!(read_back[0].key, leaves[0].key);
        assert_eq!(read_back[0].depth, leaves[0].depth);
        assert!((read_back[0].mean_prob - leaves[0].mean_prob).abs() < 1e-12);
    }

    #[test]
    fn no_header_is_written() {
        let leaves = vec![LeafCell { tree_index: 0, key: Key::new(1, 1, 1), depth: 2, mean_prob: 0.5 }];
        let mut buf = Vec::new();
        write_leaves(&mut buf, &leaves).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert_eq!(text.trim(), "1,1,1,2,0.5");
    }

    #[test]
    fn rejects_malformed_rows() {
        let bad = "1,2,3\n";
        assert!(read_leaves(bad.as_bytes()).is_err());
    }
}
