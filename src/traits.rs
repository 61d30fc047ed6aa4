use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use crate::{
    holder::HolderError,
    message::SaltCount,
    relation::{QueryFilter, Tuple},
};

/// Storage a data holder reads its relation from.
pub trait RelationStore: Send + Sync {
    fn select(&self, filter: &QueryFilter) -> Vec<Tuple>;

    fn fetch_by_tids(&self, tids: &[String]) -> Vec<Tuple>;

    fn size(&self) -> usize;

    // COUNT(*) GROUP BY join value
    fn count_by_join_value(&self, filter: &QueryFilter) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for t in self.select(filter) {
            *counts.entry(t.join_value).or_insert(0) += 1;
        }
        counts
    }
}

/// Answers post-verification payload lookups, keyed by holder-suffixed tid.
pub trait SemiJoinSource: Sync {
    fn semi_join(&self, tids: &[String]) -> BTreeMap<String, (String, String)>;
}

/// Holder side of the salt-count rendezvous.
pub trait SaltExchange: Sync {
    fn report_nmax(&self, holder: &str, nmax: usize) -> Result<(), HolderError>;

    fn await_salt_count(&self, holder: &str, timeout: Duration) -> Result<SaltCount, HolderError>;
}
