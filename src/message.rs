use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{crypto::KeyMaterial, relation::QueryFilter};

/// `(encryptedKey, encryptedValue)`
pub type Pair = (String, String);
/// `(joinKey, leftPayload, rightPayload)`
pub type Triple = (String, String, String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TwinCondition {
    Values(Vec<String>),
    Sample { p_twin: f64 },
}

impl TwinCondition {
    /// `floor(1 / pTwin)` for sampled conditions.
    pub fn inverse_probability(&self) -> Option<u64> {
        match self {
            TwinCondition::Values(_) => None,
            TwinCondition::Sample { p_twin } => {
                if *p_twin <= 0.0 {
                    Some(u64::MAX)
                } else {
                    Some((1.0 / p_twin).floor().max(1.0) as u64)
                }
            }
        }
    }
}

impl Default for TwinCondition {
    fn default() -> Self {
        TwinCondition::Values(vec![])
    }
}

/// Requested marker count and per-worker floor/ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MarkerPolicy {
    pub n: i64,
    pub n_min: i64,
    pub n_max: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub filter: QueryFilter,
    pub markers: MarkerPolicy,
    pub replication_factor: usize,
    pub twin_condition: TwinCondition,
    pub workers: Vec<String>,
    pub keys: KeyMaterial,
    pub use_occurrences: bool,
    pub is_semi_join: bool,
    pub min_salt_length: usize,
}

impl QueryRequest {
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn uses_twins(&self) -> bool {
        !self.use_occurrences && self.replication_factor >= 2
    }

    // salting is negotiated only for occurrence joins spread over several workers
    pub fn needs_salt_count(&self) -> bool {
        self.use_occurrences && self.workers.len() >= 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinQueryMessage {
    pub sender: String,
    pub join_attribute: usize,
    pub relation: Vec<Pair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedJoinQueryMessage {
    pub query: JoinQueryMessage,
    pub workers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeRequest {
    Single(JoinQueryMessage),
    Distributed(DistributedJoinQueryMessage),
}

impl ComputeRequest {
    pub fn query(&self) -> &JoinQueryMessage {
        match self {
            ComputeRequest::Single(q) => q,
            ComputeRequest::Distributed(d) => &d.query,
        }
    }

    pub fn sender(&self) -> &str {
        &self.query().sender
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFragment {
    pub id: usize,
    pub number_of_fragments: usize,
    pub rows: Vec<Triple>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemiJoinRequest {
    pub tids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SemiJoinResponse {
    pub rows: BTreeMap<String, (String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NmaxReport {
    pub holder: String,
    pub nmax: usize,
}

/// Number of salts pushed to the holders; `Skip` travels as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaltCount {
    Skip,
    Salts(usize),
}

impl SaltCount {
    pub fn to_wire(self) -> i64 {
        match self {
            SaltCount::Skip => -1,
            SaltCount::Salts(s) => s as i64,
        }
    }

    pub fn from_wire(v: i64) -> Option<Self> {
        match v {
            -1 => Some(SaltCount::Skip),
            v if v > 0 => Some(SaltCount::Salts(v as usize)),
            _ => None,
        }
    }
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).context("failed to encode message")
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).context("failed to decode message")
}
