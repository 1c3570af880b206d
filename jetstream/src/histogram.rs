//! Fixed-binning histograms with explicit under/overflow cells.
//!
//! Bin numbering follows the usual HEP convention: bin 0 is underflow, bins
//! `1..=n_bins` are the inner bins, bin `n_bins + 1` is overflow.

use serde::{Deserialize, Serialize};

/// A uniformly binned axis over `[lo, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub n_bins: usize,
    pub lo: f64,
    pub hi: f64,
}

impl Axis {
    pub const fn new(n_bins: usize, lo: f64, hi: f64) -> Self {
        Self { n_bins, lo, hi }
    }

    /// Number of cells including both flow bins.
    pub const fn n_cells(&self) -> usize {
        self.n_bins + 2
    }

    pub fn width(&self) -> f64 {
        (self.hi - self.lo) / self.n_bins as f64
    }

    /// Bin edges, length `n_bins + 1`.
    pub fn edges(&self) -> Vec<f64> {
        let w = self.width();
        (0..=self.n_bins)
            .map(|i| if i == self.n_bins { self.hi } else { self.lo + w * i as f64 })
            .collect()
    }

    /// Locate `x` on this axis. NaN lands in underflow.
    ///
    /// The only bin-resolution routine: weight filling and weight lookup both
    /// go through it, so an event is always weighted from the cell it was
    /// counted in, edges included.
    pub fn find_bin(&self, x: f64) -> usize {
        if x.is_nan() || x < self.lo {
            return 0;
        }
        if x >= self.hi {
            return self.n_bins + 1;
        }
        let bin = ((x - self.lo) / self.width()) as usize;
        bin.min(self.n_bins - 1) + 1
    }

    pub fn is_inner(&self, bin: usize) -> bool {
        bin >= 1 && bin <= self.n_bins
    }

    /// Center of inner bin `bin` (1-based).
    pub fn center(&self, bin: usize) -> f64 {
        self.lo + self.width() * (bin as f64 - 0.5)
    }
}

// ============================================================================
// 2D
// ============================================================================

/// A 2D histogram of `(x, y)` counts, including flow cells.
#[derive(Debug, Clone)]
pub struct Histogram2D {
    pub x: Axis,
    pub y: Axis,
    /// Row-major over x: `cells[x_bin * y.n_cells() + y_bin]`.
    cells: Vec<f64>,
    entries: u64,
}

impl Histogram2D {
    pub fn new(x: Axis, y: Axis) -> Self {
        Self {
            x,
            y,
            cells: vec![0.0; x.n_cells() * y.n_cells()],
            entries: 0,
        }
    }

    /// Rebuild a histogram from its cell contents (flows included).
    ///
    /// Returns `None` when `cells` does not match the axes.
    pub fn from_cells(x: Axis, y: Axis, cells: Vec<f64>) -> Option<Self> {
        (cells.len() == x.n_cells() * y.n_cells()).then(|| {
            let entries = cells.iter().sum::<f64>().max(0.0) as u64;
            Self { x, y, cells, entries }
        })
    }

    #[inline]
    fn cell(&self, x_bin: usize, y_bin: usize) -> usize {
        x_bin * self.y.n_cells() + y_bin
    }

    /// Add one unweighted entry.
    pub fn fill(&mut self, x: f64, y: f64) {
        let idx = self.cell(self.x.find_bin(x), self.y.find_bin(y));
        self.cells[idx] += 1.0;
        self.entries += 1;
    }

    pub fn get(&self, x_bin: usize, y_bin: usize) -> f64 {
        self.cells[self.cell(x_bin, y_bin)]
    }

    pub fn set(&mut self, x_bin: usize, y_bin: usize, value: f64) {
        let idx = self.cell(x_bin, y_bin);
        self.cells[idx] = value;
    }

    /// Sum over inner bins only (flows excluded).
    pub fn integral(&self) -> f64 {
        let mut sum = 0.0;
        for xb in 1..=self.x.n_bins {
            for yb in 1..=self.y.n_bins {
                sum += self.get(xb, yb);
            }
        }
        sum
    }

    /// Number of `fill` calls, flows included.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn cells(&self) -> &[f64] {
        &self.cells
    }

    /// Add another histogram with identical binning into this one.
    ///
    /// # Panics
    /// Panics if the axes differ.
    pub fn merge(&mut self, other: &Histogram2D) {
        assert!(
            self.x == other.x && self.y == other.y,
            "cannot merge histograms with different binning"
        );
        for (a, b) in self.cells.iter_mut().zip(&other.cells) {
            *a += b;
        }
        self.entries += other.entries;
    }
}

/// Equal binning and equal cell contents; the entry counter is bookkeeping.
impl PartialEq for Histogram2D {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y && self.cells == other.cells
    }
}

// ============================================================================
// 1D
// ============================================================================

/// A 1D histogram of counts, including flow cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram1D {
    pub axis: Axis,
    cells: Vec<f64>,
}

impl Histogram1D {
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            cells: vec![0.0; axis.n_cells()],
        }
    }

    pub fn fill(&mut self, x: f64) {
        let bin = self.axis.find_bin(x);
        self.cells[bin] += 1.0;
    }

    pub fn get(&self, bin: usize) -> f64 {
        self.cells[bin]
    }

    /// Inner bin contents, length `n_bins`.
    pub fn contents(&self) -> &[f64] {
        &self.cells[1..=self.axis.n_bins]
    }

    /// Largest inner bin content (0 for an empty histogram).
    pub fn max(&self) -> f64 {
        self.contents().iter().copied().fold(0.0, f64::max)
    }

    pub fn integral(&self) -> f64 {
        self.contents().iter().sum()
    }

    /// Sum over all cells, flows included.
    pub fn total(&self) -> f64 {
        self.cells.iter().sum()
    }
}
