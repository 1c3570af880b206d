//! Event records and the packed training batches built from them.

use crate::schema::{FeatureSchema, KinematicColumns};

/// One reconstructed jet.
///
/// Group tensors (`cpf`, `npf`, `sv`) are already padded to the schema's
/// `max` length and laid out position-major: `[max, n_branches]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventRecord {
    /// One-hot truth label over the schema's classes.
    pub truth: Vec<f32>,
    pub globalvars: Vec<f32>,
    pub cpf: Vec<f32>,
    pub npf: Vec<f32>,
    pub sv: Vec<f32>,
    /// Generator-level decay-length proxy.
    pub gen_vars: Vec<f32>,
}

impl EventRecord {
    /// Argmax of the truth vector (first maximum wins).
    ///
    /// Returns `None` for an empty or all-zero truth vector, i.e. an event
    /// that matched none of the class selections.
    pub fn class_index(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (i, &v) in self.truth.iter().enumerate() {
            if best.is_none_or(|(_, b)| v > b) {
                best = Some((i, v));
            }
        }
        match best {
            Some((i, v)) if v > 0.0 => Some(i),
            _ => None,
        }
    }

    pub fn pt(&self, kin: KinematicColumns) -> f32 {
        self.globalvars.get(kin.pt).copied().unwrap_or(f32::NAN)
    }

    pub fn eta(&self, kin: KinematicColumns) -> f32 {
        self.globalvars.get(kin.eta).copied().unwrap_or(f32::NAN)
    }
}

// ============================================================================
// Batch
// ============================================================================

/// Shape of one feature group inside a [`Batch`]: `[batch, len, features]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupShape {
    pub len: usize,
    pub features: usize,
}

impl GroupShape {
    fn stride(&self) -> usize {
        self.len * self.features
    }
}

/// A packed batch of B events, ready for the training loop.
///
/// All tensors are flat row-major `Vec<f32>` with shapes documented per field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub batch_size: usize,
    pub num_classes: usize,
    pub num_globals: usize,
    pub num_gen: usize,
    pub cpf_shape: GroupShape,
    pub npf_shape: GroupShape,
    pub sv_shape: GroupShape,

    /// [B, K]
    pub truth: Vec<f32>,
    /// [B, G]
    pub globalvars: Vec<f32>,
    /// [B, cpf.len, cpf.features]
    pub cpf: Vec<f32>,
    /// [B, npf.len, npf.features]
    pub npf: Vec<f32>,
    /// [B, sv.len, sv.features]
    pub sv: Vec<f32>,
    /// [B, Fg]
    pub gen_vars: Vec<f32>,
}

impl Batch {
    /// Pack records into flat tensors using the schema's shapes.
    ///
    /// Records whose vectors do not match the schema are zero-padded or
    /// truncated so every row has the same stride.
    pub fn from_records(records: &[EventRecord], schema: &FeatureSchema) -> Self {
        let b = records.len();
        let k = schema.num_classes();
        let g = schema.globalvars.len();
        let fg = schema.gen_vars.len();
        let cpf_shape = GroupShape {
            len: schema.cpf.max,
            features: schema.cpf.branches.len(),
        };
        let npf_shape = GroupShape {
            len: schema.npf.max,
            features: schema.npf.branches.len(),
        };
        let sv_shape = GroupShape {
            len: schema.sv.max,
            features: schema.sv.branches.len(),
        };

        let mut batch = Batch {
            batch_size: b,
            num_classes: k,
            num_globals: g,
            num_gen: fg,
            cpf_shape,
            npf_shape,
            sv_shape,
            truth: Vec::with_capacity(b * k),
            globalvars: Vec::with_capacity(b * g),
            cpf: Vec::with_capacity(b * cpf_shape.stride()),
            npf: Vec::with_capacity(b * npf_shape.stride()),
            sv: Vec::with_capacity(b * sv_shape.stride()),
            gen_vars: Vec::with_capacity(b * fg),
        };

        for rec in records {
            extend_fixed(&mut batch.truth, &rec.truth, k);
            extend_fixed(&mut batch.globalvars, &rec.globalvars, g);
            extend_fixed(&mut batch.cpf, &rec.cpf, cpf_shape.stride());
            extend_fixed(&mut batch.npf, &rec.npf, npf_shape.stride());
            extend_fixed(&mut batch.sv, &rec.sv, sv_shape.stride());
            extend_fixed(&mut batch.gen_vars, &rec.gen_vars, fg);
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size == 0
    }

    /// Truth row `i`, `[K]`.
    pub fn truth_row(&self, i: usize) -> &[f32] {
        &self.truth[i * self.num_classes..(i + 1) * self.num_classes]
    }

    /// Global-variable row `i`, `[G]`.
    pub fn globals_row(&self, i: usize) -> &[f32] {
        &self.globalvars[i * self.num_globals..(i + 1) * self.num_globals]
    }

    /// Generator-level row `i`, `[Fg]`.
    pub fn gen_row(&self, i: usize) -> &[f32] {
        &self.gen_vars[i * self.num_gen..(i + 1) * self.num_gen]
    }

    /// Argmax class of row `i`, `None` when the truth row is all zero.
    pub fn class_of(&self, i: usize) -> Option<usize> {
        let row = self.truth_row(i);
        let (idx, &max) = row
            .iter()
            .enumerate()
            .fold((0, &f32::NEG_INFINITY), |acc, (j, v)| if *v > *acc.1 { (j, v) } else { acc });
        (max > 0.0).then_some(idx)
    }

    /// Human-readable tensor shapes, for step logging.
    pub fn shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        let b = self.batch_size;
        vec![
            ("truth", vec![b, self.num_classes]),
            ("globalvars", vec![b, self.num_globals]),
            ("cpf", vec![b, self.cpf_shape.len, self.cpf_shape.features]),
            ("npf", vec![b, self.npf_shape.len, self.npf_shape.features]),
            ("sv", vec![b, self.sv_shape.len, self.sv_shape.features]),
            ("gen", vec![b, self.num_gen]),
        ]
    }
}

fn extend_fixed(dst: &mut Vec<f32>, src: &[f32], len: usize) {
    let n = src.len().min(len);
    dst.extend_from_slice(&src[..n]);
    dst.extend(std::iter::repeat_n(0.0, len - n));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FeatureGroup;

    fn tiny_schema() -> FeatureSchema {
        let mut schema = FeatureSchema::default();
        schema.truth.truncate(2);
        schema.globalvars = vec!["global_pt".into(), "global_eta".into()];
        schema.cpf = FeatureGroup {
            branches: vec!["a".into(), "b".into()],
            max: 2,
        };
        schema.npf = FeatureGroup {
            branches: vec![],
            max: 0,
        };
        schema.sv = FeatureGroup {
            branches: vec!["c".into()],
            max: 1,
        };
        schema
    }

    #[test]
    fn test_class_index() {
        let mut rec = EventRecord {
            truth: vec![0.0, 0.0, 1.0, 0.0],
            ..Default::default()
        };
        assert_eq!(rec.class_index(), Some(2));
        rec.truth = vec![0.0; 4];
        assert_eq!(rec.class_index(), None);
        rec.truth = vec![];
        assert_eq!(rec.class_index(), None);
        rec.truth = vec![1.0, 1.0];
        assert_eq!(rec.class_index(), Some(0));
    }

    #[test]
    fn test_kinematics_missing_are_nan() {
        let rec = EventRecord {
            globalvars: vec![2.0],
            ..Default::default()
        };
        let kin = KinematicColumns::default();
        assert_eq!(rec.pt(kin), 2.0);
        assert!(rec.eta(kin).is_nan());
    }

    #[test]
    fn test_batch_packing_pads_and_truncates() {
        let schema = tiny_schema();
        let records = vec![
            EventRecord {
                truth: vec![1.0, 0.0],
                globalvars: vec![1.5, 0.1],
                cpf: vec![1.0, 2.0, 3.0, 4.0],
                npf: vec![],
                sv: vec![9.0],
                gen_vars: vec![0.7],
            },
            EventRecord {
                truth: vec![0.0, 1.0],
                globalvars: vec![2.5, -1.0],
                cpf: vec![5.0, 6.0],
                npf: vec![],
                sv: vec![8.0, 7.0],
                gen_vars: vec![],
            },
        ];
        let batch = Batch::from_records(&records, &schema);
        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.cpf, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0]);
        assert_eq!(batch.sv, vec![9.0, 8.0]);
        assert_eq!(batch.gen_vars, vec![0.7, 0.0]);
        assert_eq!(batch.globals_row(1), &[2.5, -1.0]);
        assert_eq!(batch.class_of(0), Some(0));
        assert_eq!(batch.class_of(1), Some(1));
        assert_eq!(batch.shapes()[2], ("cpf", vec![2, 2, 2]));
    }
}
