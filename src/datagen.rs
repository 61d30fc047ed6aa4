use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{config::HolderDataConfig, relation::Relation};

const MIN_AGE: u32 = 18;
const MAX_AGE: u32 = 100;

/// Tuples per proportion bucket; fractional parts are carried forward and the
/// shortfall goes to the last bucket.
pub fn bucket_sizes(size: usize, proportions: &[f64]) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(proportions.len());
    let mut carry = 0.0;
    for p in proportions {
        let exact = size as f64 * p;
        let mut n = exact.floor() as usize;
        carry += exact - n as f64;
        if carry >= 1.0 - 1e-9 {
            n += 1;
            carry -= 1.0;
        }
        sizes.push(n);
    }
    let total: usize = sizes.iter().sum();
    if let Some(last) = sizes.last_mut() {
        if total < size {
            *last += size - total;
        }
    }
    sizes
}

// values past the end of the pool get a numeric suffix and join with nothing
fn pool_value(pool: &[String], idx: usize) -> String {
    let base = &pool[idx % pool.len()];
    if idx >= pool.len() {
        format!("{}{}", base, idx / pool.len())
    } else {
        base.clone()
    }
}

/// Synthetic `(ID, joinValue, age)` relation for one holder.
pub fn generate_relation(config: &HolderDataConfig, pool: &[String]) -> Relation {
    let mut relation = Relation::default();
    if pool.is_empty() {
        return relation;
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let offset = rng.gen_range(0..pool.len());
    debug!(offset, "join value offset");

    if config.join_proportions.is_empty() {
        for i in 0..config.size {
            let age = rng.gen_range(MIN_AGE..=MAX_AGE);
            relation.push(pool_value(pool, offset + i), age.to_string());
        }
    } else {
        let sizes = bucket_sizes(config.size, &config.join_proportions);
        for (i, n) in sizes.iter().enumerate() {
            let value = pool_value(pool, offset + i);
            for _ in 0..*n {
                let age = rng.gen_range(MIN_AGE..=MAX_AGE);
                relation.push(value.clone(), age.to_string());
            }
        }
    }
    info!(
        tuples = relation.get_size(),
        distinct = relation.distinct_join_values().len(),
        "relation generated"
    );
    relation
}
