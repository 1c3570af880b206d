//! Offline construction of the per-class resampling weights.
//!
//! One 2D histogram of `(log10 pT, eta)` is filled per truth class over the
//! full training file set. Bin counts are then turned into weights
//! `avg_events / count`, so that after resampling every populated bin of every
//! class carries roughly `avg_events` jets:
//!
//! ```text
//! avg_events = mean_c( integral_c / n_pt_bins / n_eta_bins )
//! weight     = 0                        if count < MIN_BIN_COUNT
//!            = avg_events / count       otherwise
//! ```
//!
//! All flow cells get weight 0, so jets outside the binned range are dropped.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::histogram::{Axis, Histogram2D};
use crate::record::EventRecord;
use crate::schema::{FeatureSchema, KinematicColumns, SchemaError};
use crate::selection::FLAG_THRESHOLD;
use crate::source::{SourceError, SourceFactory};

/// log10(pT / GeV) binning. Part of the weight-file contract.
pub const PT_AXIS: Axis = Axis::new(10, 1.3, 3.0);
/// Pseudorapidity binning. Part of the weight-file contract.
pub const ETA_AXIS: Axis = Axis::new(3, -2.4, 2.4);
/// Bins with fewer raw entries than this are suppressed (weight 0).
pub const MIN_BIN_COUNT: f64 = 4.0;

// ============================================================================
// Weight Table
// ============================================================================

/// Per-class raw counts and derived weights over the same binning.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    pub pt_axis: Axis,
    pub eta_axis: Axis,
    /// Mean events per bin across classes; 0 in the degenerate empty case.
    pub avg_events: f64,
    pub min_count: f64,
    /// Raw fill counts per class, flows included.
    pub counts: Vec<Histogram2D>,
    /// Derived weights per class, flows zeroed.
    pub weights: Vec<Histogram2D>,
}

impl WeightTable {
    /// Turn raw per-class counts into weights.
    ///
    /// A class with zero entries contributes 0 to `avg_events` and all its
    /// weights end up 0 (every bin is below the count floor), so the class is
    /// effectively dropped. With no classes at all `avg_events` is 0.
    pub fn from_counts(counts: Vec<Histogram2D>, min_count: f64) -> Self {
        let pt_axis = counts.first().map(|h| h.x).unwrap_or(PT_AXIS);
        let eta_axis = counts.first().map(|h| h.y).unwrap_or(ETA_AXIS);
        let avg_events = average_events_per_bin(&counts);

        let weights = counts
            .iter()
            .map(|hist| {
                let mut w = Histogram2D::new(hist.x, hist.y);
                for pt_bin in 1..=hist.x.n_bins {
                    for eta_bin in 1..=hist.y.n_bins {
                        let count = hist.get(pt_bin, eta_bin);
                        let value = if count < min_count {
                            0.0
                        } else {
                            avg_events / count
                        };
                        w.set(pt_bin, eta_bin, value);
                    }
                }
                // Flow cells stay at the 0 they were created with.
                w
            })
            .collect();

        Self {
            pt_axis,
            eta_axis,
            avg_events,
            min_count,
            counts,
            weights,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.weights.len()
    }
}

/// `mean over classes of (integral / n_x / n_y)`, or 0 if undefined.
pub fn average_events_per_bin(hists: &[Histogram2D]) -> f64 {
    if hists.is_empty() {
        return 0.0;
    }
    let sum: f64 = hists
        .iter()
        .map(|h| h.integral() / h.x.n_bins as f64 / h.y.n_bins as f64)
        .sum();
    let avg = sum / hists.len() as f64;
    if avg.is_finite() { avg } else { 0.0 }
}

// ============================================================================
// Builder
// ============================================================================

/// Accumulates per-class `(pT, eta)` counts over an offline pass.
#[derive(Debug, Clone)]
pub struct WeightBuilder {
    kinematics: KinematicColumns,
    hists: Vec<Histogram2D>,
}

impl WeightBuilder {
    pub fn new(schema: &FeatureSchema) -> Result<Self, SchemaError> {
        Ok(Self::with_classes(schema.num_classes(), schema.kinematic_columns()?))
    }

    pub fn with_classes(num_classes: usize, kinematics: KinematicColumns) -> Self {
        Self {
            kinematics,
            hists: (0..num_classes)
                .map(|_| Histogram2D::new(PT_AXIS, ETA_AXIS))
                .collect(),
        }
    }

    /// Fill every class whose truth flag is set on this record.
    pub fn fill(&mut self, record: &EventRecord) {
        let pt = record.pt(self.kinematics) as f64;
        let eta = record.eta(self.kinematics) as f64;
        for (hist, &flag) in self.hists.iter_mut().zip(&record.truth) {
            if flag > FLAG_THRESHOLD {
                hist.fill(pt, eta);
            }
        }
    }

    pub fn merge(&mut self, other: &WeightBuilder) {
        for (a, b) in self.hists.iter_mut().zip(&other.hists) {
            a.merge(b);
        }
    }

    /// Raw per-class count histograms filled so far.
    pub fn counts(&self) -> &[Histogram2D] {
        &self.hists
    }

    /// Fill from every file, scanning files in parallel.
    ///
    /// Each file fills a private builder; the partial builders are merged at
    /// the end. The first file error aborts the pass. `on_file_done` is called
    /// once per finished file (used for progress reporting).
    pub fn fill_files<F>(
        &mut self,
        factory: &dyn SourceFactory,
        files: &[PathBuf],
        chunk: usize,
        on_file_done: F,
    ) -> Result<u64, SourceError>
    where
        F: Fn(&Path) + Sync,
    {
        let partials: Vec<(WeightBuilder, u64)> = files
            .par_iter()
            .map(|path| -> Result<(WeightBuilder, u64), SourceError> {
                let mut local = WeightBuilder {
                    kinematics: self.kinematics,
                    hists: self
                        .hists
                        .iter()
                        .map(|h| Histogram2D::new(h.x, h.y))
                        .collect(),
                };
                let mut source = factory.open(path, chunk)?;
                let mut n = 0u64;
                while let Some(records) = source.next_batch()? {
                    for rec in &records {
                        local.fill(rec);
                    }
                    n += records.len() as u64;
                }
                debug!("  {}: {} events", path.display(), n);
                on_file_done(path);
                Ok((local, n))
            })
            .collect::<Result<_, _>>()?;

        let mut total = 0;
        for (partial, n) in &partials {
            self.merge(partial);
            total += n;
        }
        info!("Weight pass: {} files, {} events", files.len(), total);
        Ok(total)
    }

    /// Finish the pass and derive weights.
    pub fn finish(self) -> WeightTable {
        let table = WeightTable::from_counts(self.hists, MIN_BIN_COUNT);
        info!(
            "Weights: {} classes, avg_events/bin = {:.3}",
            table.num_classes(),
            table.avg_events
        );
        table
    }
}

/// The whole offline pass for `schema`: fill from every file, then derive
/// the weights.
pub fn build_table<F>(
    schema: &FeatureSchema,
    factory: &dyn SourceFactory,
    files: &[PathBuf],
    chunk: usize,
    on_file_done: F,
) -> Result<WeightTable, SourceError>
where
    F: Fn(&Path) + Sync,
{
    let mut builder = WeightBuilder::new(schema)?;
    builder.fill_files(factory, files, chunk, on_file_done)?;
    Ok(builder.finish())
}
