//! Nuclear masks: one boolean footprint per segmented nucleus, positioned by
//! the top-left offset of its bounding box in the full image.

use ndarray::{s, Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct NuclearMask {
    pub mask: Array2<bool>,
    /// `(row, col)` of the mask's top-left corner in source image coordinates.
    pub offset: (usize, usize),
}

impl NuclearMask {
    pub fn dim(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn area(&self) -> usize {
        self.mask.iter().filter(|&&v| v).count()
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut npz = NpzReader::new(fs::File::open(path)?)?;
        let names = npz.names()?;
        let find = |key: &str| {
            names
                .iter()
                .find(|n| n.trim_end_matches(".npy") == key)
                .cloned()
                .ok_or_else(|| PipelineError::InvalidNpy {
                    path: path.to_path_buf(),
                    reason: format!("missing `{key}` array"),
                })
        };
        let mask_name = find("mask")?;
        let offset_name = find("offset")?;
        let mask: Array2<bool> = npz.by_name(&mask_name)?;
        let offset: Array1<i64> = npz.by_name(&offset_name)?;
        let (row, col) = match offset.as_slice() {
            Some(&[row, col]) if row >= 0 && col >= 0 => (row as usize, col as usize),
            _ => {
                return Err(PipelineError::InvalidNpy {
                    path: path.to_path_buf(),
                    reason: format!("offset must be two non-negative integers, got {offset}"),
                })
            }
        };
        Ok(NuclearMask {
            mask,
            offset: (row, col),
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut npz = NpzWriter::new(fs::File::create(path)?);
        npz.add_array("mask", &self.mask)?;
        let offset = Array1::from(vec![self.offset.0 as i64, self.offset.1 as i64]);
        npz.add_array("offset", &offset)?;
        npz.finish()?;
        Ok(())
    }
}

/// Split a label raster (background 0) into one mask per label, keyed by label.
pub fn split_labels(labels: &Array2<u32>) -> BTreeMap<u32, NuclearMask> {
    // label -> (min_row, min_col, max_row, max_col)
    let mut bounds: BTreeMap<u32, (usize, usize, usize, usize)> = BTreeMap::new();
    for ((row, col), &label) in labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        bounds
            .entry(label)
            .and_modify(|b| {
                b.0 = b.0.min(row);
                b.1 = b.1.min(col);
                b.2 = b.2.max(row);
                b.3 = b.3.max(col);
            })
            .or_insert((row, col, row, col));
    }
    bounds
        .into_iter()
        .map(|(label, (r0, c0, r1, c1))| {
            let mask = labels.slice(s![r0..=r1, c0..=c1]).mapv(|v| v == label);
            (label, NuclearMask { mask, offset: (r0, c0) })
        })
        .collect()
}

const FAR: f64 = 1e20;

/// Squared 1-D distance transform (Felzenszwalb & Huttenlocher).
fn squared_edt_1d(f: &[f64], out: &mut [f64]) {
    let n = f.len();
    let mut v = vec![0usize; n];
    let mut z = vec![0f64; n + 1];
    let mut k = 0usize;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;
    for q in 1..n {
        let intersect = |p: usize| {
            let (qf, pf) = (q as f64, p as f64);
            ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * qf - 2.0 * pf)
        };
        let mut boundary = intersect(v[k]);
        while boundary <= z[k] {
            k -= 1;
            boundary = intersect(v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = boundary;
        z[k + 1] = f64::INFINITY;
    }
    k = 0;
    for (q, o) in out.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let d = q as f64 - v[k] as f64;
        *o = d * d + f[v[k]];
    }
}

/// Euclidean distance from each nucleus pixel to the nearest non-nucleus pixel.
/// Pixels outside the mask rectangle count as background; background is 0.
pub fn distance_transform(mask: &Array2<bool>) -> Array2<f64> {
    let (rows, cols) = mask.dim();
    let (pr, pc) = (rows + 2, cols + 2);
    let mut grid = Array2::<f64>::zeros((pr, pc));
    for ((r, c), &inside) in mask.indexed_iter() {
        if inside {
            grid[(r + 1, c + 1)] = FAR;
        }
    }
    let mut column = vec![0f64; pr];
    let mut out = vec![0f64; pr.max(pc)];
    for c in 0..pc {
        for r in 0..pr {
            column[r] = grid[(r, c)];
        }
        squared_edt_1d(&column, &mut out[..pr]);
        for r in 0..pr {
            grid[(r, c)] = out[r];
        }
    }
    let mut row = vec![0f64; pc];
    for r in 0..pr {
        for c in 0..pc {
            row[c] = grid[(r, c)];
        }
        squared_edt_1d(&row, &mut out[..pc]);
        for c in 0..pc {
            grid[(r, c)] = out[c];
        }
    }
    grid.slice(s![1..=rows, 1..=cols]).mapv(f64::sqrt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn splits_labels_into_tight_boxes() {
        let labels = array![
            [0u32, 0, 0, 0, 0],
            [0, 1, 1, 0, 0],
            [0, 1, 0, 0, 2],
            [0, 0, 0, 0, 2],
        ];
        let masks = split_labels(&labels);
        assert_eq!(masks.len(), 2);
        assert_eq!(masks[&1].offset, (1, 1));
        assert_eq!(masks[&1].mask, array![[true, true], [true, false]]);
        assert_eq!(masks[&2].offset, (2, 4));
        assert_eq!(masks[&2].mask, array![[true], [true]]);
        assert_eq!(masks[&1].area(), 3);
    }

    #[test]
    fn npz_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m_nuclear_mask_001.npz");
        let mask = NuclearMask {
            mask: array![[false, true], [true, true]],
            offset: (12, 40),
        };
        mask.write(&path).unwrap();
        assert_eq!(NuclearMask::read(&path).unwrap(), mask);
    }

    #[test]
    fn distance_to_edge_of_square() {
        let mask = Array2::from_elem((5, 5), true);
        let dt = distance_transform(&mask);
        assert_eq!(dt[(0, 0)], 1.0);
        assert_eq!(dt[(1, 1)], 2.0);
        assert_eq!(dt[(2, 2)], 3.0);
        assert_eq!(dt[(2, 0)], 1.0);
    }

    #[test]
    fn background_is_zero_and_diagonals_are_euclidean() {
        let mut mask = Array2::from_elem((7, 7), false);
        mask.slice_mut(s![1..6, 1..6]).fill(true);
        mask[(1, 1)] = false;
        let dt = distance_transform(&mask);
        assert_eq!(dt[(1, 1)], 0.0);
        assert_eq!(dt[(0, 3)], 0.0);
        assert!((dt[(2, 2)] - 2f64.sqrt()).abs() < 1e-12);
        assert!((dt[(3, 3)] - 8f64.sqrt()).abs() < 1e-12);
        assert_eq!(dt[(5, 5)], 1.0);
    }
}
