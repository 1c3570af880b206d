//! Feature schema: which columns of the event files feed which tensors.
//!
//! The schema mirrors the layout of the jet ntuples: a list of truth classes
//! (each defined by a selection over `jetorigin_*` flags), a flat list of global
//! jet variables, three padded particle/vertex groups, and the generator-level
//! decay-length proxy used for diagnostics.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::selection::{Selection, SelectionError};

/// Name of the global variable holding log10(pT).
pub const PT_COLUMN: &str = "global_pt";
/// Name of the global variable holding pseudorapidity.
pub const ETA_COLUMN: &str = "global_eta";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse schema: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("schema defines no truth classes")]
    NoClasses,

    #[error("global variable '{0}' is required but missing from the schema")]
    MissingKinematic(&'static str),

    #[error("column '{0}' appears more than once")]
    DuplicateColumn(String),

    #[error("feature group '{0}' has branches but max length 0")]
    EmptyGroup(String),

    #[error("invalid selection for class '{class}': {source}")]
    Selection {
        class: String,
        #[source]
        source: SelectionError,
    },
}

/// One truth class: a display name and the flag expression selecting it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TruthClass {
    pub name: String,
    pub selection: String,
}

/// A padded variable-length feature group (charged/neutral candidates, SVs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureGroup {
    /// List-valued columns, one per feature.
    pub branches: Vec<String>,
    /// Sequences are padded with zeros or truncated to this length.
    pub max: usize,
}

impl FeatureGroup {
    /// Number of `f32` values one event contributes: `max * branches`.
    pub fn flat_len(&self) -> usize {
        self.max * self.branches.len()
    }
}

/// Positions of the kinematic variables inside `globalvars`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KinematicColumns {
    pub pt: usize,
    pub eta: usize,
}

impl Default for KinematicColumns {
    fn default() -> Self {
        Self { pt: 0, eta: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureSchema {
    pub truth: Vec<TruthClass>,
    pub globalvars: Vec<String>,
    pub cpf: FeatureGroup,
    pub npf: FeatureGroup,
    pub sv: FeatureGroup,
    /// Scalar generator-level columns (decay-length proxy).
    #[serde(rename = "gen")]
    pub gen_vars: Vec<String>,
}

impl FeatureSchema {
    /// Load a schema from a JSON file and validate it.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)?;
        let schema: FeatureSchema = serde_json::from_str(&text)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Check structural invariants: at least one class, kinematic columns
    /// present, no duplicated columns, every selection compiles.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.truth.is_empty() {
            return Err(SchemaError::NoClasses);
        }
        self.kinematic_columns()?;
        for class in &self.truth {
            Selection::compile(&class.selection).map_err(|source| SchemaError::Selection {
                class: class.name.clone(),
                source,
            })?;
        }
        for (name, group) in [("cpf", &self.cpf), ("npf", &self.npf), ("sv", &self.sv)] {
            if group.max == 0 && !group.branches.is_empty() {
                return Err(SchemaError::EmptyGroup(name.to_string()));
            }
        }

        let mut seen = HashSet::new();
        let feature_columns = self
            .globalvars
            .iter()
            .chain(&self.cpf.branches)
            .chain(&self.npf.branches)
            .chain(&self.sv.branches)
            .chain(&self.gen_vars);
        for col in feature_columns {
            if !seen.insert(col.as_str()) {
                return Err(SchemaError::DuplicateColumn(col.clone()));
            }
        }
        Ok(())
    }

    pub fn num_classes(&self) -> usize {
        self.truth.len()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.truth.iter().map(|c| c.name.clone()).collect()
    }

    /// Resolve where `global_pt` / `global_eta` live inside `globalvars`.
    pub fn kinematic_columns(&self) -> Result<KinematicColumns, SchemaError> {
        let find = |name: &'static str| {
            self.globalvars
                .iter()
                .position(|c| c == name)
                .ok_or(SchemaError::MissingKinematic(name))
        };
        Ok(KinematicColumns {
            pt: find(PT_COLUMN)?,
            eta: find(ETA_COLUMN)?,
        })
    }

    /// Compile every class selection, in class order.
    pub fn selections(&self) -> Result<Vec<Selection>, SchemaError> {
        self.truth
            .iter()
            .map(|class| {
                Selection::compile(&class.selection).map_err(|source| SchemaError::Selection {
                    class: class.name.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Every column an input file must provide (flags first, deduplicated).
    pub fn required_columns(&self) -> Result<Vec<String>, SchemaError> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !out.iter().any(|c| c == name) {
                out.push(name.to_string());
            }
        };
        for sel in self.selections()? {
            for col in sel.columns() {
                push(col);
            }
        }
        for col in self
            .globalvars
            .iter()
            .chain(&self.cpf.branches)
            .chain(&self.npf.branches)
            .chain(&self.sv.branches)
            .chain(&self.gen_vars)
        {
            push(col);
        }
        Ok(out)
    }
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for FeatureSchema {
    /// The realistic jet-tagging feature set.
    fn default() -> Self {
        Self {
            truth: vec![
                TruthClass {
                    name: "B".into(),
                    selection: "jetorigin_isB||jetorigin_isBB||jetorigin_isGBB||\
                                jetorigin_isLeptonic_B||jetorigin_isLeptonic_C"
                        .into(),
                },
                TruthClass {
                    name: "C".into(),
                    selection: "jetorigin_isC||jetorigin_isCC||jetorigin_isGCC".into(),
                },
                TruthClass {
                    name: "UDS".into(),
                    selection: "jetorigin_isUD||jetorigin_isS".into(),
                },
                TruthClass {
                    name: "G".into(),
                    selection: "jetorigin_isG".into(),
                },
            ],
            globalvars: strings(&[
                "global_pt",
                "global_eta",
                "ncpf",
                "nnpf",
                "nsv",
                "csv_trackSumJetEtRatio",
                "csv_trackSumJetDeltaR",
                "csv_vertexCategory",
                "csv_trackSip2dValAboveCharm",
                "csv_trackSip2dSigAboveCharm",
                "csv_trackSip3dValAboveCharm",
                "csv_trackSip3dSigAboveCharm",
                "csv_jetNSelectedTracks",
                "csv_jetNTracksEtaRel",
            ]),
            cpf: FeatureGroup {
                branches: strings(&[
                    "cpf_trackEtaRel",
                    "cpf_trackPtRel",
                    "cpf_trackPPar",
                    "cpf_trackDeltaR",
                    "cpf_trackPParRatio",
                    "cpf_trackSip2dVal",
                    "cpf_trackSip2dSig",
                    "cpf_trackSip3dVal",
                    "cpf_trackSip3dSig",
                    "cpf_trackJetDistVal",
                    "cpf_ptrel",
                    "cpf_drminsv",
                    "cpf_vertex_association",
                    "cpf_puppi_weight",
                    "cpf_track_chi2",
                    "cpf_track_ndof",
                    "cpf_track_quality",
                ]),
                max: 25,
            },
            npf: FeatureGroup {
                branches: strings(&[
                    "npf_ptrel",
                    "npf_deltaR",
                    "npf_isGamma",
                    "npf_hcal_fraction",
                    "npf_drminsv",
                    "npf_puppi_weight",
                ]),
                max: 25,
            },
            sv: FeatureGroup {
                branches: strings(&[
                    "sv_pt",
                    "sv_deltaR",
                    "sv_mass",
                    "sv_ntracks",
                    "sv_chi2",
                    "sv_ndof",
                    "sv_dxy",
                    "sv_dxysig",
                    "sv_d3d",
                    "sv_d3dsig",
                    "sv_costhetasvpv",
                    "sv_enratio",
                ]),
                max: 4,
            },
            gen_vars: strings(&["jetorigin_displacement"]),
        }
    }
}
