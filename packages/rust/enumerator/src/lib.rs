//! Working-set enumeration from a spatial mask.
//!
//! The required coordinates are the set cells of a land mask, thinned to every
//! `k`-th row and column and optionally restricted to a region mask. The result
//! is rounded to fixed precision so filenames are stable across runs.

mod raster;

use std::collections::HashSet;

use gridharvest_shared::{Coordinate, HarvestError, Result};
use tracing::{debug, info, instrument};

pub use raster::{GridGeometry, Mask, Raster};

/// Derive the coordinates to acquire.
///
/// Keeps every `downsample`-th row and column of `mask` (starting at row 0,
/// column 0) where the mask is set and, if given, `region` is set at the
/// nearest cell. Coordinates are rounded to fixed precision, de-duplicated
/// (first occurrence wins) and sorted by x, then y.
///
/// Pure: no I/O. Fails with [`HarvestError::InvalidMask`] if `mask` has no
/// set cells.
#[instrument(skip_all, fields(downsample = downsample))]
pub fn enumerate(
    mask: &Mask,
    downsample: usize,
    region: Option<&Mask>,
) -> Result<Vec<Coordinate>> {
    if downsample == 0 {
        return Err(HarvestError::validation("downsample factor must be at least 1"));
    }

    let set_cells = mask.count_true();
    if set_cells == 0 {
        return Err(HarvestError::invalid_mask("mask has zero true cells"));
    }

    let g = mask.geometry();
    let mut seen = HashSet::new();
    let mut coords = Vec::new();
    let mut outside_region = 0usize;

    for row in (0..g.nrows).step_by(downsample) {
        for col in (0..g.ncols).step_by(downsample) {
            if !mask.get(row, col) {
                continue;
            }
            let (x, y) = g.cell_center(row, col);
            if let Some(region) = region {
                if !region.contains_point(x, y) {
                    outside_region += 1;
                    continue;
                }
            }
            let coord = Coordinate::new(x, y);
            if seen.insert(coord) {
                coords.push(coord);
            }
        }
    }

    coords.sort_unstable();

    debug!(outside_region, "region filter applied");
    info!(
        mask_cells = set_cells,
        coordinates = coords.len(),
        "working set enumerated"
    );
    Ok(coords)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(ncols: usize, nrows: usize, cell_size: f64) -> GridGeometry {
        GridGeometry {
            ncols,
            nrows,
            x_min: 0.0,
            y_max: nrows as f64 * cell_size,
            cell_size,
        }
    }

    fn full_mask(ncols: usize, nrows: usize, cell_size: f64) -> Mask {
        Mask::new(geometry(ncols, nrows, cell_size), vec![true; ncols * nrows]).unwrap()
    }

    #[test]
    fn downsample_picks_every_kth_row_and_column() {
        let mask = full_mask(4, 4, 1.0);
        let coords = enumerate(&mask, 2, None).unwrap();
        let expected = vec![
            Coordinate::new(0.5, 1.5),
            Coordinate::new(0.5, 3.5),
            Coordinate::new(2.5, 1.5),
            Coordinate::new(2.5, 3.5),
        ];
        assert_eq!(coords, expected);
    }

    #[test]
    fn factor_one_keeps_every_set_cell() {
        let cells = vec![true, false, false, true];
        let mask = Mask::new(geometry(2, 2, 1.0), cells).unwrap();
        let coords = enumerate(&mask, 1, None).unwrap();
        assert_eq!(coords, vec![Coordinate::new(0.5, 1.5), Coordinate::new(1.5, 0.5)]);
    }

    #[test]
    fn region_filter_restricts_by_nearest_cell() {
        let mask = full_mask(4, 1, 1.0);
        // Region covers the western half only, at a coarser resolution.
        let region_geom = GridGeometry {
            ncols: 2,
            nrows: 1,
            x_min: 0.0,
            y_max: 1.0,
            cell_size: 2.0,
        };
        let region = Mask::new(region_geom, vec![true, false]).unwrap();

        let coords = enumerate(&mask, 1, Some(&region)).unwrap();
        assert_eq!(coords, vec![Coordinate::new(0.5, 0.5), Coordinate::new(1.5, 0.5)]);
    }

    #[test]
    fn cells_rounding_to_same_pair_are_deduplicated() {
        // 0.001-degree cells: ten neighbours share each rounded x.
        let mask = full_mask(20, 1, 0.001);
        let coords = enumerate(&mask, 1, None).unwrap();
        let unique: HashSet<_> = coords.iter().copied().collect();
        assert_eq!(unique.len(), coords.len());
        assert!(coords.len() <= 3);
    }

    #[test]
    fn output_is_sorted_and_deterministic() {
        let raster = Raster::parse(
            "ncols 3\nnrows 3\nxllcorner 110\nyllcorner -40\ncellsize 1\nNODATA_value -9999\n\
             1 1 1\n1 -9999 1\n1 1 1\n",
        )
        .unwrap();
        let mask = raster.to_mask(-1.0);

        let first = enumerate(&mask, 1, None).unwrap();
        let second = enumerate(&mask, 1, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        assert!(!first.contains(&Coordinate::new(111.5, -38.5)));
    }

    #[test]
    fn empty_mask_is_invalid() {
        let mask = Mask::new(geometry(2, 2, 1.0), vec![false; 4]).unwrap();
        let err = enumerate(&mask, 1, None).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidMask { .. }));
    }

    #[test]
    fn zero_downsample_is_rejected() {
        let mask = full_mask(2, 2, 1.0);
        assert!(enumerate(&mask, 0, None).is_err());
    }
}
