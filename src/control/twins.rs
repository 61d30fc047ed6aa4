use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use super::{ControlError, RealEntry};
use crate::{
    crypto::CryptoBox,
    engine::assign_worker,
    message::{QueryRequest, TwinCondition},
    TWIN_SALT_RETRY_SEP, TWIN_SALT_SEP,
};

/// `-<counter>` left padded with zeros to `min_length - 1` digits.
pub fn twin_salt(min_length: usize, counter: usize) -> Result<String, ControlError> {
    if min_length == 0 {
        return Err(ControlError::InvalidSaltLength);
    }
    let width = min_length - 1;
    Ok(format!("{}{:0>width$}", TWIN_SALT_SEP, counter, width = width))
}

/// Explicit membership, or the keyed-hash sample `h_k(v) mod floor(1/p) == 0`.
pub fn is_twin_candidate(condition: &TwinCondition, crypto: &CryptoBox, join_value: &str) -> bool {
    match condition {
        TwinCondition::Values(values) => values.iter().any(|v| v == join_value),
        TwinCondition::Sample { .. } => {
            let inverse_p = condition.inverse_probability().unwrap_or(1);
            crypto.sampled(join_value, inverse_p)
        }
    }
}

/// Produces `r - 1` re-salted copies of every selected tuple. Counters are
/// kept per tid and carry over between calls on the same generator.
#[derive(Debug, Default)]
pub struct TwinGenerator {
    counters: HashMap<String, usize>,
}

impl TwinGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, tid: &str) -> usize {
        self.counters.get(tid).copied().unwrap_or(0)
    }

    pub fn generate(
        &mut self,
        crypto: &CryptoBox,
        request: &QueryRequest,
        tuples: &[RealEntry],
    ) -> Result<Vec<RealEntry>, ControlError> {
        let num_workers = request.num_workers();
        if num_workers == 0 {
            return Err(ControlError::NoWorkers);
        }
        // fail before touching any counter
        twin_salt(request.min_salt_length, 0)?;

        let mut twins = vec![];
        for t in tuples {
            if !is_twin_candidate(&request.twin_condition, crypto, &t.join_value) {
                continue;
            }
            let mut counter = self.counter(&t.tid);
            let mut used: HashSet<usize> = HashSet::new();
            used.insert(assign_worker(&crypto.encrypt(&t.join_value), num_workers));
            for _ in 1..request.replication_factor {
                let base = format!(
                    "{}{}",
                    t.join_value,
                    twin_salt(request.min_salt_length, counter)?
                );
                let mut candidate = base.clone();
                let mut w = assign_worker(&crypto.encrypt(&candidate), num_workers);
                let mut retry = 0;
                while used.contains(&w) && used.len() < num_workers && retry < num_workers {
                    candidate = format!("{}{}{}", base, TWIN_SALT_RETRY_SEP, retry);
                    w = assign_worker(&crypto.encrypt(&candidate), num_workers);
                    retry += 1;
                }
                debug!(twin = %candidate, worker = w, "twin assigned");
                used.insert(w);
                twins.push(t.with_key(candidate));
                counter += 1;
            }
            self.counters.insert(t.tid.clone(), counter);
        }
        info!(twins = twins.len(), "twins generated");
        Ok(twins)
    }
}
