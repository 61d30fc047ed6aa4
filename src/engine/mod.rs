//! The untrusted computation layer: a single aggregator or a pool of
//! workers joining encrypted relations.

pub mod partition;
pub mod worker;

pub use partition::{assign_worker, partition};
pub use worker::{hash_join, FaultProfile, Worker};

use std::{any::Any, collections::BTreeMap, thread};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    config::SimulationConfig,
    message::{ComputeRequest, DistributedJoinQueryMessage, JoinQueryMessage, ResultFragment, Triple},
    utils::{rng_from, split_by_chunk_size},
    HOLDER_L, HOLDER_R,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("single-node and distributed requests mixed in one join")]
    ModeMismatch,
    #[error("senders disagree on the worker list")]
    WorkerListMismatch,
    #[error("empty worker list")]
    NoWorkers,
    #[error("join attribute position {0} is neither 0 nor 1")]
    BadJoinAttribute(usize),
    #[error("worker {index} terminated abnormally: {reason}")]
    WorkerFault { index: usize, reason: String },
    #[error("relation from unknown sender {0}")]
    UnknownSender(String),
    #[error("{name} = {value} is outside [0, 1]")]
    InvalidProbability { name: &'static str, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Collecting,
    Joining,
    Reducing,
    Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub tampering_probability: f64,
    pub lazy_probability: f64,
    pub trusted_worker_fraction: f64,
    pub max_fragment_size: usize,
    pub seed: Option<u64>,
}

impl From<&SimulationConfig> for EngineConfig {
    fn from(c: &SimulationConfig) -> Self {
        Self {
            tampering_probability: c.tampering_probability,
            lazy_probability: c.lazy_probability,
            trusted_worker_fraction: c.trusted_worker_fraction,
            max_fragment_size: c.max_fragment_size,
            seed: c.seed,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, value) in [
            ("tampering_probability", self.tampering_probability),
            ("lazy_probability", self.lazy_probability),
            ("trusted_worker_fraction", self.trusted_worker_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::InvalidProbability { name, value });
            }
        }
        Ok(())
    }

    fn faults(&self) -> FaultProfile {
        FaultProfile {
            tampering_probability: self.tampering_probability,
            lazy_probability: self.lazy_probability,
        }
    }
}

pub struct JoinEngine {
    config: EngineConfig,
    state: EngineState,
    collected: BTreeMap<String, ComputeRequest>,
    rng: StdRng,
}

impl JoinEngine {
    pub fn new(config: EngineConfig) -> Self {
        let rng = rng_from(config.seed);
        Self {
            config,
            state: EngineState::Collecting,
            collected: BTreeMap::new(),
            rng,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Accepts one holder's relation. Once both holders have sent, the join
    /// runs and the fragments to ship to the client are returned.
    pub fn submit(
        &mut self,
        request: ComputeRequest,
    ) -> Result<Option<Vec<ResultFragment>>, EngineError> {
        self.config.validate()?;
        if self.state == EngineState::Sent {
            self.state = EngineState::Collecting;
        }
        let sender = request.sender().to_string();
        if sender != HOLDER_L && sender != HOLDER_R {
            return Err(EngineError::UnknownSender(sender));
        }
        info!(sender = %sender, rows = request.query().relation.len(), "relation received");
        if self.collected.insert(sender.clone(), request).is_some() {
            warn!(sender = %sender, "relation replaced by a later submission");
        }
        if self.collected.len() < 2 {
            return Ok(None);
        }

        let mut collected = std::mem::take(&mut self.collected);
        let (Some(left), Some(right)) = (collected.remove(HOLDER_L), collected.remove(HOLDER_R)) else {
            return Ok(None);
        };
        let res = self.join(left, right);
        self.state = match res {
            Ok(_) => EngineState::Sent,
            Err(_) => EngineState::Collecting,
        };
        res.map(|rows| Some(self.fragments(rows)))
    }

    fn join(&mut self, left: ComputeRequest, right: ComputeRequest) -> Result<Vec<Triple>, EngineError> {
        for q in [left.query(), right.query()] {
            if q.join_attribute > 1 {
                return Err(EngineError::BadJoinAttribute(q.join_attribute));
            }
        }
        self.state = EngineState::Joining;
        match (left, right) {
            (ComputeRequest::Single(l), ComputeRequest::Single(r)) => Ok(self.single_join(&l, &r)),
            (ComputeRequest::Distributed(l), ComputeRequest::Distributed(r)) => {
                let partial = self.distributed_join(&l, &r)?;
                self.state = EngineState::Reducing;
                Ok(partial.concat())
            }
            _ => Err(EngineError::ModeMismatch),
        }
    }

    fn single_join(&mut self, left: &JoinQueryMessage, right: &JoinQueryMessage) -> Vec<Triple> {
        let mut rng = StdRng::seed_from_u64(self.rng.gen());
        let rows = hash_join(
            &left.relation,
            left.join_attribute,
            &right.relation,
            right.join_attribute,
            self.config.faults(),
            &mut rng,
        );
        info!(rows = rows.len(), "single-node join done");
        rows
    }

    /// Partial results ordered by worker index.
    fn distributed_join(
        &mut self,
        left: &DistributedJoinQueryMessage,
        right: &DistributedJoinQueryMessage,
    ) -> Result<Vec<Vec<Triple>>, EngineError> {
        if left.workers != right.workers {
            return Err(EngineError::WorkerListMismatch);
        }
        let num_workers = left.workers.len();
        if num_workers == 0 {
            return Err(EngineError::NoWorkers);
        }
        let (la, ra) = (left.query.join_attribute, right.query.join_attribute);
        let left_parts = partition(&left.query.relation, la, num_workers);
        let right_parts = partition(&right.query.relation, ra, num_workers);
        let num_trusted = (num_workers as f64 * self.config.trusted_worker_fraction).round() as usize;
        info!(workers = num_workers, trusted = num_trusted, "distributed join started");

        let mut pool = vec![];
        for (i, (l, r)) in left_parts.into_iter().zip(right_parts).enumerate() {
            let rng = StdRng::seed_from_u64(self.rng.gen());
            if l.is_empty() || r.is_empty() {
                debug!(worker = i, left = l.len(), right = r.len(), "worker skipped");
                continue;
            }
            let worker = Worker::new(
                i,
                left.workers[i].clone(),
                i < num_trusted,
                self.config.faults(),
                rng,
            );
            pool.push((worker, l, r));
        }

        let outcomes: Vec<(usize, thread::Result<Vec<Triple>>)> = thread::scope(|s| {
            let handles: Vec<_> = pool
                .into_iter()
                .map(|(mut worker, l, r)| {
                    let index = worker.index;
                    (index, s.spawn(move || worker.run(&l, la, &r, ra)))
                })
                .collect();
            handles.into_iter().map(|(i, h)| (i, h.join())).collect()
        });

        let mut partial = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes {
            match outcome {
                Ok(rows) => partial.push(rows),
                Err(payload) => {
                    return Err(EngineError::WorkerFault {
                        index,
                        reason: panic_reason(payload.as_ref()),
                    })
                }
            }
        }
        Ok(partial)
    }

    fn fragments(&self, rows: Vec<Triple>) -> Vec<ResultFragment> {
        let mut chunks = split_by_chunk_size(rows, self.config.max_fragment_size.max(1));
        if chunks.is_empty() {
            chunks.push(vec![]);
        }
        let total = chunks.len();
        info!(fragments = total, "result fragments emitted");
        chunks
            .into_iter()
            .enumerate()
            .map(|(id, rows)| ResultFragment {
                id,
                number_of_fragments: total,
                rows,
            })
            .collect()
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
