//! Control tuples injected by the data holders: markers, twins and
//! occurrence tags.

pub mod markers;
pub mod occurrence;
pub mod twins;

pub use markers::{Marker, MarkerGenerator, MarkerSet};
pub use occurrence::OccurrenceControl;
pub use twins::{is_twin_candidate, twin_salt, TwinGenerator};

use crate::{DUMMY, FIELD_SEP};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("invalid marker bounds: n = {n}, n_min = {n_min}, n_max = {n_max}")]
    InvalidMarkerBounds { n: i64, n_min: i64, n_max: i64 },
    #[error("empty worker list")]
    NoWorkers,
    #[error("{n} markers cannot be placed on {workers} workers holding at most {n_max} each")]
    UnreachableMarkerCount { n: i64, workers: usize, n_max: i64 },
    #[error("gave up after {attempts} marker candidates with {accepted} accepted")]
    MarkerSearchExhausted { attempts: usize, accepted: usize },
    #[error("salt length must be > 0")]
    InvalidSaltLength,
}

/// A real tuple on its way out of a holder. `key` is the join value as sent,
/// possibly salted; `join_value` stays the logical one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealEntry {
    pub tid: String,
    pub key: String,
    pub join_value: String,
    pub attr: Option<String>,
    pub occurrence: Option<usize>,
}

impl RealEntry {
    pub fn payload(&self) -> String {
        let mut fields = vec![self.tid.clone(), self.join_value.clone()];
        if let Some(attr) = &self.attr {
            fields.push(attr.clone());
        }
        if let Some(occ) = self.occurrence {
            fields.push(occ.to_string());
        }
        fields.join(&FIELD_SEP.to_string())
    }

    pub fn with_key(&self, key: String) -> Self {
        Self {
            key,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Real(RealEntry),
    Marker(Marker),
    Dummy { key: String, join_value: String },
}

impl Entry {
    pub fn key(&self) -> String {
        match self {
            Entry::Real(e) => e.key.clone(),
            Entry::Marker(m) => m.value(),
            Entry::Dummy { key, .. } => key.clone(),
        }
    }

    pub fn payload(&self) -> String {
        match self {
            Entry::Real(e) => e.payload(),
            Entry::Marker(m) => m.payload(),
            Entry::Dummy { join_value, .. } => dummy_payload(join_value),
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Entry::Real(_))
    }
}

pub fn dummy_payload(join_value: &str) -> String {
    format!("{DUMMY}{FIELD_SEP}{join_value}{FIELD_SEP}{DUMMY}")
}
