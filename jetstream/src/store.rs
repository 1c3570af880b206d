//! On-disk weight histograms and the read-only lookup used by resampler lanes.
//!
//! File layout (`.jwh`), all integers and floats little-endian:
//!
//! ```text
//! [magic "JWHT"] [version u32] [header_len u32] [header JSON, header_len bytes]
//! per class c in header order:
//!     counts_c  : (nx+2)*(ny+2) x f64   raw fill counts, flows included
//!     weights_c : (nx+2)*(ny+2) x f64   derived weights, flows zero
//! ```
//!
//! The JSON header carries the class names and selections, both axes,
//! `avg_events` and `min_count`, so a file can be inspected and looked up
//! without the schema that built it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::histogram::{Axis, Histogram2D};
use crate::schema::TruthClass;
use crate::weights::WeightTable;

pub const MAGIC: &[u8; 4] = b"JWHT";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed weight header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("not a weight file (bad magic)")]
    BadMagic,

    #[error("unsupported weight file version {0} (expected {expected})", expected = FORMAT_VERSION)]
    UnsupportedVersion(u32),

    #[error("weight file truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("weight file has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("{classes} class names for {tables} weight tables")]
    ClassMismatch { classes: usize, tables: usize },

    #[error("weight file class {index} is {stored}, schema expects {expected}")]
    ClassDefinition {
        index: usize,
        stored: String,
        expected: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreHeader {
    classes: Vec<TruthClass>,
    pt_axis: Axis,
    eta_axis: Axis,
    avg_events: f64,
    min_count: f64,
}

/// Immutable per-class weight lookup.
///
/// Built once, then shared across lanes as `Arc<WeightStore>`; every method
/// takes `&self`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightStore {
    classes: Vec<TruthClass>,
    table: WeightTable,
}

impl WeightStore {
    pub fn new(classes: Vec<TruthClass>, table: WeightTable) -> Result<Self, StoreError> {
        if classes.len() != table.num_classes() || table.counts.len() != table.weights.len() {
            return Err(StoreError::ClassMismatch {
                classes: classes.len(),
                tables: table.num_classes(),
            });
        }
        Ok(Self { classes, table })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[TruthClass] {
        &self.classes
    }

    /// Check that this store was built for `expected`: same classes in the
    /// same order, each with the same name and selection.
    pub fn check_classes(&self, expected: &[TruthClass]) -> Result<(), StoreError> {
        if self.classes.len() != expected.len() {
            return Err(StoreError::ClassMismatch {
                classes: expected.len(),
                tables: self.classes.len(),
            });
        }
        let describe = |c: &TruthClass| format!("{} ({})", c.name, c.selection);
        match self.classes.iter().zip(expected).position(|(a, b)| a != b) {
            Some(index) => Err(StoreError::ClassDefinition {
                index,
                stored: describe(&self.classes[index]),
                expected: describe(&expected[index]),
            }),
            None => Ok(()),
        }
    }

    pub fn table(&self) -> &WeightTable {
        &self.table
    }

    pub fn pt_axis(&self) -> Axis {
        self.table.pt_axis
    }

    pub fn eta_axis(&self) -> Axis {
        self.table.eta_axis
    }

    /// Resolve raw `(pt, eta)` into `(pt_bin, eta_bin)`, flows included.
    /// Same cells [`Histogram2D::fill`] uses when the counts are built.
    #[inline]
    pub fn bin_of(&self, pt: f64, eta: f64) -> (usize, usize) {
        (
            self.table.pt_axis.find_bin(pt),
            self.table.eta_axis.find_bin(eta),
        )
    }

    /// Weight for an event of class `class` at `(pt, eta)`.
    ///
    /// Unknown class, NaN, or anything outside the binned range gives 0.
    #[inline]
    pub fn lookup(&self, class: usize, pt: f64, eta: f64) -> f64 {
        let Some(weights) = self.table.weights.get(class) else {
            return 0.0;
        };
        let (pt_bin, eta_bin) = self.bin_of(pt, eta);
        if !self.table.pt_axis.is_inner(pt_bin) || !self.table.eta_axis.is_inner(eta_bin) {
            return 0.0;
        }
        weights.get(pt_bin, eta_bin)
    }

    /// Weight stored in cell `(pt_bin, eta_bin)`; `None` for an unknown class
    /// or a bin index past the overflow cell.
    pub fn weight_at(&self, class: usize, pt_bin: usize, eta_bin: usize) -> Option<f64> {
        self.cell(&self.table.weights, class, pt_bin, eta_bin)
    }

    /// Raw fill count in cell `(pt_bin, eta_bin)`.
    pub fn raw_count_at(&self, class: usize, pt_bin: usize, eta_bin: usize) -> Option<f64> {
        self.cell(&self.table.counts, class, pt_bin, eta_bin)
    }

    fn cell(
        &self,
        hists: &[Histogram2D],
        class: usize,
        pt_bin: usize,
        eta_bin: usize,
    ) -> Option<f64> {
        let hist = hists.get(class)?;
        (pt_bin < hist.x.n_cells() && eta_bin < hist.y.n_cells()).then(|| hist.get(pt_bin, eta_bin))
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let header = StoreHeader {
            classes: self.classes.clone(),
            pt_axis: self.table.pt_axis,
            eta_axis: self.table.eta_axis,
            avg_events: self.table.avg_events,
            min_count: self.table.min_count,
        };
        let header_json = serde_json::to_vec(&header)?;

        let mut w = BufWriter::new(File::create(path)?);

        // -- Preamble --
        w.write_all(MAGIC)?;
        w.write_all(&FORMAT_VERSION.to_le_bytes())?;
        w.write_all(&(header_json.len() as u32).to_le_bytes())?;
        w.write_all(&header_json)?;

        // -- Per-class cells --
        for (counts, weights) in self.table.counts.iter().zip(&self.table.weights) {
            for v in counts.cells().iter().chain(weights.cells()) {
                w.write_all(&v.to_le_bytes())?;
            }
        }

        w.flush()?;
        info!(
            "Saved weights for {} classes to {}",
            self.classes.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path)?;
        let mut r = ByteReader::new(&bytes);

        if r.take(MAGIC.len())? != MAGIC {
            return Err(StoreError::BadMagic);
        }
        let version = r.u32()?;
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        let header_len = r.u32()? as usize;
        let header: StoreHeader = serde_json::from_slice(r.take(header_len)?)?;

        let n_cells = header.pt_axis.n_cells() * header.eta_axis.n_cells();
        let mut counts = Vec::with_capacity(header.classes.len());
        let mut weights = Vec::with_capacity(header.classes.len());
        for _ in &header.classes {
            for out in [&mut counts, &mut weights] {
                let cells = r.f64s(n_cells)?;
                // Length was checked by `f64s`.
                if let Some(hist) = Histogram2D::from_cells(header.pt_axis, header.eta_axis, cells) {
                    out.push(hist);
                }
            }
        }
        if r.remaining() > 0 {
            return Err(StoreError::TrailingBytes(r.remaining()));
        }

        let table = WeightTable {
            pt_axis: header.pt_axis,
            eta_axis: header.eta_axis,
            avg_events: header.avg_events,
            min_count: header.min_count,
            counts,
            weights,
        };
        Self::new(header.classes, table)
    }
}

/// Bounds-checked little-endian cursor over a byte slice.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.bytes.len());
        let Some(end) = end else {
            return Err(StoreError::Truncated {
                expected: self.pos.saturating_add(n),
                actual: self.bytes.len(),
            });
        };
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn f64s(&mut self, n: usize) -> Result<Vec<f64>, StoreError> {
        let raw = self.take(n.saturating_mul(8))?;
        Ok(raw
            .chunks_exact(8)
            .map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                f64::from_le_bytes(buf)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{ETA_AXIS, MIN_BIN_COUNT, PT_AXIS};

    fn classes(n: usize) -> Vec<TruthClass> {
        (0..n)
            .map(|i| TruthClass {
                name: format!("class{i}"),
                selection: format!("flag{i}"),
            })
            .collect()
    }

    /// Class 0: 8 entries at pt bin 3 / eta bin 2, 2 entries at pt bin 5.
    /// Class 1: 4 entries at pt bin 3 / eta bin 2.
    fn sample_store() -> WeightStore {
        let mut a = Histogram2D::new(PT_AXIS, ETA_AXIS);
        let mut b = Histogram2D::new(PT_AXIS, ETA_AXIS);
        for _ in 0..8 {
            a.fill(1.7, 0.0);
        }
        for _ in 0..2 {
            a.fill(2.1, 0.0);
        }
        for _ in 0..4 {
            b.fill(1.7, 0.0);
        }
        a.fill(0.5, 0.0); // underflow
        let table = WeightTable::from_counts(vec![a, b], MIN_BIN_COUNT);
        WeightStore::new(classes(2), table).unwrap()
    }

    #[test]
    fn test_lookup_resolves_bins() {
        let store = sample_store();
        let avg = store.table().avg_events;
        assert!((avg - 7.0 / 30.0).abs() < 1e-12);
        assert_eq!(store.bin_of(1.7, 0.0), (3, 2));
        assert_eq!(store.lookup(0, 1.7, 0.0), avg / 8.0);
        assert_eq!(store.lookup(1, 1.7, 0.0), avg / 4.0);
        // 2 entries < 4
        assert_eq!(store.lookup(0, 2.1, 0.0), 0.0);
        assert_eq!(store.raw_count_at(0, 5, 2), Some(2.0));
        assert_eq!(store.weight_at(0, 5, 2), Some(0.0));
    }

    #[test]
    fn test_lookup_out_of_range_is_zero() {
        let store = sample_store();
        assert_eq!(store.lookup(0, 0.5, 0.0), 0.0);
        assert_eq!(store.lookup(0, 3.5, 0.0), 0.0);
        assert_eq!(store.lookup(0, 1.7, 2.4), 0.0);
        assert_eq!(store.lookup(0, 1.7, -9.0), 0.0);
        assert_eq!(store.lookup(0, f64::NAN, 0.0), 0.0);
        assert_eq!(store.lookup(0, 1.7, f64::NAN), 0.0);
        assert_eq!(store.lookup(7, 1.7, 0.0), 0.0);
        assert_eq!(store.weight_at(7, 3, 2), None);
        assert_eq!(store.weight_at(0, 12, 2), None);
        // The underflow entry is counted but never weighted.
        assert_eq!(store.raw_count_at(0, 0, 2), Some(1.0));
        assert_eq!(store.weight_at(0, 0, 2), Some(0.0));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.jwh");
        let store = sample_store();
        store.save(&path).unwrap();

        let loaded = WeightStore::load(&path).unwrap();
        assert_eq!(loaded, store);
        assert_eq!(loaded.classes()[1].selection, "flag1");
        assert_eq!(loaded.lookup(1, 1.7, 0.0), store.lookup(1, 1.7, 0.0));
    }

    #[test]
    fn test_header_floats_reload_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.jwh");
        let pt = Axis::new(7, 0.1 + 0.2, 1.0 / 3.0 + 2.0);
        let eta = Axis::new(3, -2.4, 2.4);
        let mut h = Histogram2D::new(pt, eta);
        for i in 0..40 {
            h.fill(0.3 + i as f64 * 0.05, 0.0);
        }
        let table = WeightTable::from_counts(vec![h], MIN_BIN_COUNT);
        let store = WeightStore::new(classes(1), table).unwrap();
        store.save(&path).unwrap();

        let loaded = WeightStore::load(&path).unwrap();
        assert_eq!(loaded.pt_axis().lo.to_bits(), pt.lo.to_bits());
        assert_eq!(loaded.pt_axis().hi.to_bits(), pt.hi.to_bits());
        assert_eq!(
            loaded.table().avg_events.to_bits(),
            store.table().avg_events.to_bits()
        );
        for i in 0..=pt.n_bins {
            let x = pt.lo + pt.width() * i as f64;
            assert_eq!(loaded.bin_of(x, 0.0), store.bin_of(x, 0.0), "x = {x}");
        }
    }

    /// `x` and its two neighbouring floats (nonzero `x`).
    fn neighbours(x: f64) -> [f64; 3] {
        let bits = x.to_bits();
        [f64::from_bits(bits - 1), x, f64::from_bits(bits + 1)]
    }

    #[test]
    fn test_lookup_uses_fill_cell_at_every_edge() {
        let store = sample_store();
        let mut points = Vec::new();
        for pt_edge in PT_AXIS.edges() {
            for eta_edge in ETA_AXIS.edges() {
                for pt in neighbours(pt_edge) {
                    for eta in neighbours(eta_edge) {
                        points.push((pt, eta));
                    }
                }
            }
        }
        for (pt, eta) in points {
            let mut h = Histogram2D::new(PT_AXIS, ETA_AXIS);
            h.fill(pt, eta);
            let (x, y) = store.bin_of(pt, eta);
            assert_eq!(h.get(x, y), 1.0, "pt = {pt}, eta = {eta}");
        }
    }

    #[test]
    fn test_check_classes() {
        let store = sample_store();
        assert!(store.check_classes(&classes(2)).is_ok());
        assert!(matches!(
            store.check_classes(&classes(3)),
            Err(StoreError::ClassMismatch { classes: 3, tables: 2 })
        ));

        let mut renamed = classes(2);
        renamed[1].selection = "other_flag".into();
        match store.check_classes(&renamed) {
            Err(StoreError::ClassDefinition { index, stored, expected }) => {
                assert_eq!(index, 1);
                assert_eq!(stored, "class1 (flag1)");
                assert_eq!(expected, "class1 (other_flag)");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.jwh");
        sample_store().save(&path).unwrap();
        let good = std::fs::read(&path).unwrap();

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        std::fs::write(&path, &bad_magic).unwrap();
        assert!(matches!(WeightStore::load(&path), Err(StoreError::BadMagic)));

        let mut bad_version = good.clone();
        bad_version[4..8].copy_from_slice(&9u32.to_le_bytes());
        std::fs::write(&path, &bad_version).unwrap();
        assert!(matches!(
            WeightStore::load(&path),
            Err(StoreError::UnsupportedVersion(9))
        ));

        std::fs::write(&path, &good[..good.len() - 8]).unwrap();
        assert!(matches!(
            WeightStore::load(&path),
            Err(StoreError::Truncated { .. })
        ));

        let mut trailing = good.clone();
        trailing.push(0);
        std::fs::write(&path, &trailing).unwrap();
        assert!(matches!(
            WeightStore::load(&path),
            Err(StoreError::TrailingBytes(1))
        ));

        assert!(matches!(
            WeightStore::load(&dir.path().join("missing.jwh")),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn test_class_count_must_match_tables() {
        let table = WeightTable::from_counts(vec![Histogram2D::new(PT_AXIS, ETA_AXIS)], 4.0);
        assert!(matches!(
            WeightStore::new(classes(2), table),
            Err(StoreError::ClassMismatch { classes: 2, tables: 1 })
        ));
    }
}
