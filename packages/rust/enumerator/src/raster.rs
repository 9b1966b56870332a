//! ESRI ASCII grid (`.asc`) reader and boolean masks.
//!
//! Format:
//! - Header lines `ncols`, `nrows`, `xllcorner|xllcenter`,
//!   `yllcorner|yllcenter`, `cellsize`, optional `NODATA_value`
//! - Then `nrows` rows of `ncols` whitespace-separated values, top row first

use std::path::Path;

use gridharvest_shared::{HarvestError, Result};
use tracing::debug;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Placement of a regular grid. Row 0 is the northernmost row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    pub ncols: usize,
    pub nrows: usize,
    /// Western edge of column 0.
    pub x_min: f64,
    /// Northern edge of row 0.
    pub y_max: f64,
    pub cell_size: f64,
}

impl GridGeometry {
    /// Centre of the cell at `(row, col)`.
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.x_min + (col as f64 + 0.5) * self.cell_size;
        let y = self.y_max - (row as f64 + 0.5) * self.cell_size;
        (x, y)
    }

    /// The cell whose area contains `(x, y)`, i.e. the cell with the nearest centre.
    pub fn cell_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.x_min) / self.cell_size).floor();
        let row = ((self.y_max - y) / self.cell_size).floor();
        if col < 0.0 || row < 0.0 || !col.is_finite() || !row.is_finite() {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        (row < self.nrows && col < self.ncols).then_some((row, col))
    }

    fn len(&self) -> usize {
        self.ncols * self.nrows
    }
}

// ---------------------------------------------------------------------------
// Raster
// ---------------------------------------------------------------------------

/// A parsed grid of numeric cell values.
#[derive(Debug, Clone)]
pub struct Raster {
    geometry: GridGeometry,
    nodata: Option<f64>,
    values: Vec<f64>,
}

impl Raster {
    /// Read and parse an ASCII grid file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;
        let raster = Self::parse(&content).map_err(|e| match e {
            HarvestError::Parse { message } => {
                HarvestError::parse(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        debug!(
            path = %path.display(),
            ncols = raster.geometry.ncols,
            nrows = raster.geometry.nrows,
            "raster loaded"
        );
        Ok(raster)
    }

    /// Parse ASCII grid content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut header = Header::default();
        let mut tokens = content.split_whitespace().peekable();

        // Header keys are words; the first numeric token starts the data block.
        while let Some(&token) = tokens.peek() {
            if !token.starts_with(|c: char| c.is_ascii_alphabetic()) {
                break;
            }
            let key = token.to_ascii_lowercase();
            tokens.next();
            let value = tokens
                .next()
                .ok_or_else(|| HarvestError::parse(format!("header '{key}' has no value")))?;
            header.set(&key, value)?;
        }

        let geometry = header.geometry()?;
        let mut values = Vec::with_capacity(geometry.len());
        for token in tokens {
            let v: f64 = token
                .parse()
                .map_err(|_| HarvestError::parse(format!("invalid cell value '{token}'")))?;
            values.push(v);
        }

        if values.len() != geometry.len() {
            return Err(HarvestError::parse(format!(
                "expected {} cell values ({} x {}), found {}",
                geometry.len(),
                geometry.nrows,
                geometry.ncols,
                values.len()
            )));
        }

        Ok(Self {
            geometry,
            nodata: header.nodata,
            values,
        })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Cell value, `None` for NODATA cells or out-of-range indices.
    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.geometry.nrows || col >= self.geometry.ncols {
            return None;
        }
        let v = self.values[row * self.geometry.ncols + col];
        match self.nodata {
            Some(nodata) if v == nodata => None,
            _ if v.is_nan() => None,
            _ => Some(v),
        }
    }

    /// Mask of cells holding data with a value of at least `min_value`.
    pub fn to_mask(&self, min_value: f64) -> Mask {
        let g = self.geometry;
        let cells = (0..g.nrows)
            .flat_map(|row| (0..g.ncols).map(move |col| (row, col)))
            .map(|(row, col)| self.value(row, col).is_some_and(|v| v >= min_value))
            .collect();
        Mask { geometry: g, cells }
    }
}

#[derive(Default)]
struct Header {
    ncols: Option<usize>,
    nrows: Option<usize>,
    xll: Option<(f64, bool)>,
    yll: Option<(f64, bool)>,
    cell_size: Option<f64>,
    nodata: Option<f64>,
}

impl Header {
    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let num = || -> Result<f64> {
            value
                .parse::<f64>()
                .map_err(|_| HarvestError::parse(format!("invalid value '{value}' for '{key}'")))
        };
        let count = || -> Result<usize> {
            value
                .parse::<usize>()
                .map_err(|_| HarvestError::parse(format!("invalid value '{value}' for '{key}'")))
        };

        match key {
            "ncols" => self.ncols = Some(count()?),
            "nrows" => self.nrows = Some(count()?),
            "xllcorner" => self.xll = Some((num()?, false)),
            "xllcenter" => self.xll = Some((num()?, true)),
            "yllcorner" => self.yll = Some((num()?, false)),
            "yllcenter" => self.yll = Some((num()?, true)),
            "cellsize" => self.cell_size = Some(num()?),
            "nodata_value" => self.nodata = Some(num()?),
            other => return Err(HarvestError::parse(format!("unknown header key '{other}'"))),
        }
        Ok(())
    }

    fn geometry(&self) -> Result<GridGeometry> {
        let missing = |name: &str| HarvestError::parse(format!("missing header '{name}'"));

        let ncols = self.ncols.ok_or_else(|| missing("ncols"))?;
        let nrows = self.nrows.ok_or_else(|| missing("nrows"))?;
        let cell_size = self.cell_size.ok_or_else(|| missing("cellsize"))?;
        let (xll, x_center) = self.xll.ok_or_else(|| missing("xllcorner"))?;
        let (yll, y_center) = self.yll.ok_or_else(|| missing("yllcorner"))?;

        if ncols == 0 || nrows == 0 {
            return Err(HarvestError::parse("grid has zero rows or columns"));
        }
        if cell_size.is_nan() || cell_size <= 0.0 {
            return Err(HarvestError::parse(format!("cellsize must be positive, got {cell_size}")));
        }

        let half = cell_size / 2.0;
        let x_min = if x_center { xll - half } else { xll };
        let y_min = if y_center { yll - half } else { yll };

        Ok(GridGeometry {
            ncols,
            nrows,
            x_min,
            y_max: y_min + nrows as f64 * cell_size,
            cell_size,
        })
    }
}

// ---------------------------------------------------------------------------
// Mask
// ---------------------------------------------------------------------------

/// A boolean grid.
#[derive(Debug, Clone)]
pub struct Mask {
    geometry: GridGeometry,
    cells: Vec<bool>,
}

impl Mask {
    /// Build a mask from row-major cells (row 0 first).
    pub fn new(geometry: GridGeometry, cells: Vec<bool>) -> Result<Self> {
        if cells.len() != geometry.len() {
            return Err(HarvestError::validation(format!(
                "mask has {} cells, geometry needs {}",
                cells.len(),
                geometry.len()
            )));
        }
        Ok(Self { geometry, cells })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        row < self.geometry.nrows
            && col < self.geometry.ncols
            && self.cells[row * self.geometry.ncols + col]
    }

    pub fn count_true(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// Whether the cell nearest to `(x, y)` is set. Points off the grid are not.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        self.geometry
            .cell_at(x, y)
            .is_some_and(|(row, col)| self.get(row, col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRID: &str = "\
ncols 3
nrows 2
xllcorner 100.0
yllcorner -30.0
cellsize 1.0
NODATA_value -9999
1 -9999 5
0 -2 7
";

    #[test]
    fn parse_header_and_values() {
        let raster = Raster::parse(GRID).unwrap();
        let g = raster.geometry();
        assert_eq!((g.ncols, g.nrows), (3, 2));
        assert_eq!(g.x_min, 100.0);
        assert_eq!(g.y_max, -28.0);
        assert_eq!(raster.value(0, 0), Some(1.0));
        assert_eq!(raster.value(0, 1), None);
        assert_eq!(raster.value(1, 2), Some(7.0));
        assert_eq!(raster.value(2, 0), None);
    }

    #[test]
    fn cell_centres_from_corner_and_center_headers() {
        let raster = Raster::parse(GRID).unwrap();
        assert_eq!(raster.geometry().cell_center(0, 0), (100.5, -28.5));
        assert_eq!(raster.geometry().cell_center(1, 2), (102.5, -29.5));

        let centered = "ncols 1\nnrows 1\nxllcenter 10.5\nyllcenter 20.5\ncellsize 1\n3\n";
        let raster = Raster::parse(centered).unwrap();
        assert_eq!(raster.geometry().cell_center(0, 0), (10.5, 20.5));
    }

    #[test]
    fn mask_applies_nodata_and_threshold() {
        let mask = Raster::parse(GRID).unwrap().to_mask(-1.0);
        assert!(mask.get(0, 0));
        assert!(!mask.get(0, 1)); // NODATA
        assert!(mask.get(1, 0)); // 0 >= -1
        assert!(!mask.get(1, 1)); // -2 < -1
        assert_eq!(mask.count_true(), 4);
    }

    #[test]
    fn nearest_cell_lookup() {
        let mask = Raster::parse(GRID).unwrap().to_mask(-1.0);
        assert!(mask.contains_point(100.1, -28.9));
        assert!(!mask.contains_point(101.5, -28.5));
        assert!(mask.contains_point(102.99, -29.99));
        assert!(!mask.contains_point(99.9, -28.5));
        assert!(!mask.contains_point(100.5, -27.9));
    }

    #[test]
    fn rejects_wrong_value_count() {
        let short = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 1 1\n";
        let err = Raster::parse(short).unwrap_err();
        assert!(err.to_string().contains("expected 4 cell values"));
    }

    #[test]
    fn rejects_missing_or_unknown_header() {
        let no_cellsize = "ncols 1\nnrows 1\nxllcorner 0\nyllcorner 0\n1\n";
        assert!(Raster::parse(no_cellsize).unwrap_err().to_string().contains("cellsize"));

        let unknown = "ncols 1\nnrows 1\nxllcorner 0\nyllcorner 0\ncellsize 1\nbands 3\n1\n";
        assert!(Raster::parse(unknown).is_err());
    }

    #[test]
    fn load_reports_path_on_parse_error() {
        let path = std::env::temp_dir().join(format!("gh-raster-{}.asc", uuid::Uuid::now_v7()));
        std::fs::write(&path, "ncols x\n").unwrap();
        let err = Raster::load(&path).unwrap_err();
        assert!(err.to_string().contains(&path.display().to_string()));
        let _ = std::fs::remove_file(&path);
    }
}
