//! Online per-event resampling against the weight store.
//!
//! Each event is emitted `multiplicity(w, u)` times, where `w` is the weight of
//! its `(class, pT, eta)` bin and `u ~ U[0, 1)` is a fresh draw:
//!
//! ```text
//! copies = floor(w) + (u < w - floor(w))      E[copies] = w
//! ```
//!
//! For `w <= 1` this is a plain Bernoulli accept with probability `w`; above 1
//! it is integer replication plus one Bernoulli extra copy. There is no state
//! shared between events, so lanes resample independently.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::prelude::*;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::record::EventRecord;
use crate::schema::KinematicColumns;
use crate::selection::FLAG_THRESHOLD;
use crate::store::WeightStore;

/// Most copies a single event can produce.
pub const MAX_COPIES: u32 = 1 << 16;

/// Output multiplicity for weight `weight` and uniform draw `u`.
///
/// Non-finite or non-positive weights give 0. Weights of `MAX_COPIES` or more
/// give exactly `MAX_COPIES` copies.
#[inline]
pub fn multiplicity(weight: f64, u: f64) -> u32 {
    if !weight.is_finite() || weight <= 0.0 {
        return 0;
    }
    if weight >= MAX_COPIES as f64 {
        return MAX_COPIES;
    }
    let whole = weight.floor();
    whole as u32 + u32::from(u < weight - whole)
}

// ============================================================================
// Gen-level substitution
// ============================================================================

/// Which truth flags mark an event for gen-level substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassPredicate {
    /// The flag at this truth index is set.
    Index(usize),
    /// Any of these truth flags is set.
    AnyOf(BTreeSet<usize>),
    /// None of these truth flags is set.
    NoneOf(BTreeSet<usize>),
}

impl ClassPredicate {
    /// Whether some truth vector of length `num_classes` can satisfy this
    /// predicate.
    pub fn can_match(&self, num_classes: usize) -> bool {
        match self {
            ClassPredicate::Index(i) => *i < num_classes,
            ClassPredicate::AnyOf(ids) => ids.iter().any(|&i| i < num_classes),
            ClassPredicate::NoneOf(_) => true,
        }
    }

    pub fn matches(&self, truth: &[f32]) -> bool {
        let set = |i: &usize| truth.get(*i).is_some_and(|&v| v > FLAG_THRESHOLD);
        match self {
            ClassPredicate::Index(i) => set(i),
            ClassPredicate::AnyOf(ids) => ids.iter().any(set),
            ClassPredicate::NoneOf(ids) => !ids.iter().any(set),
        }
    }
}

/// Overwrites the gen-level fields of background events with a sentinel.
///
/// The decay-length proxy only means something for the signal class; leaving
/// it on background jets would put a spurious shape into their distribution.
///
/// The default predicate is truth index 4, which needs a schema with at least
/// five classes. With the built-in four-class schema it never fires, and
/// `Pipeline::spawn` warns about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenSubstitution {
    pub predicate: ClassPredicate,
    pub sentinel: f32,
}

impl Default for GenSubstitution {
    fn default() -> Self {
        Self {
            predicate: ClassPredicate::Index(4),
            sentinel: 0.0,
        }
    }
}

impl GenSubstitution {
    /// Returns whether the record was rewritten.
    pub fn apply(&self, record: &mut EventRecord) -> bool {
        if !self.predicate.matches(&record.truth) {
            return false;
        }
        record.gen_vars.fill(self.sentinel);
        true
    }
}

// ============================================================================
// Resampler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResampleDecision {
    /// Argmax truth class, `None` if the event matched no class.
    pub class: Option<usize>,
    pub weight: f64,
    pub copies: u32,
}

/// Running totals, for lane logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResampleStats {
    pub seen: u64,
    pub emitted: u64,
    pub dropped: u64,
}

/// One lane's resampler: a shared read-only store plus a private RNG.
pub struct Resampler {
    store: Arc<WeightStore>,
    kinematics: KinematicColumns,
    rng: SmallRng,
    stats: ResampleStats,
}

impl Resampler {
    pub fn new(store: Arc<WeightStore>, kinematics: KinematicColumns, seed: u64) -> Self {
        Self {
            store,
            kinematics,
            rng: SmallRng::seed_from_u64(seed),
            stats: ResampleStats::default(),
        }
    }

    /// Weight of the record's bin; events with no class weigh 0.
    pub fn weight_of(&self, record: &EventRecord) -> (Option<usize>, f64) {
        let class = record.class_index();
        let weight = class.map_or(0.0, |c| {
            self.store.lookup(
                c,
                record.pt(self.kinematics) as f64,
                record.eta(self.kinematics) as f64,
            )
        });
        (class, weight)
    }

    /// Draw the number of copies to emit for one record.
    pub fn decide(&mut self, record: &EventRecord) -> ResampleDecision {
        let (class, weight) = self.weight_of(record);
        let u: f64 = self.rng.random();
        let copies = multiplicity(weight, u);
        self.stats.seen += 1;
        if copies == 0 {
            self.stats.dropped += 1;
        }
        self.stats.emitted += copies as u64;
        ResampleDecision {
            class,
            weight,
            copies,
        }
    }

    /// Resample a chunk, appending the emitted events to `out`.
    pub fn resample_into(&mut self, records: Vec<EventRecord>, out: &mut Vec<EventRecord>) {
        for record in records {
            let copies = self.decide(&record).copies;
            if copies == 0 {
                continue;
            }
            for _ in 1..copies {
                out.push(record.clone());
            }
            out.push(record);
        }
    }

    pub fn resample(&mut self, records: Vec<EventRecord>) -> Vec<EventRecord> {
        let mut out = Vec::with_capacity(records.len());
        self.resample_into(records, &mut out);
        out
    }

    pub fn stats(&self) -> ResampleStats {
        self.stats
    }
}
