use std::{collections::BTreeMap, time::Duration};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    control::{Entry, MarkerGenerator, OccurrenceControl, RealEntry, TwinGenerator},
    crypto::CryptoBox,
    message::{
        ComputeRequest, DistributedJoinQueryMessage, JoinQueryMessage, Pair, QueryRequest,
        SaltCount, SemiJoinRequest, SemiJoinResponse,
    },
    salt::SaltBucketizer,
    traits::{RelationStore, SaltExchange, SemiJoinSource},
    TID_SEP,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HolderError {
    #[error("holder {holder} gave up waiting for the salt count after {waited_ms} ms")]
    SaltTimeout { holder: String, waited_ms: u64 },
    #[error("salt channel of holder {0} closed")]
    SaltChannelClosed(String),
    #[error("salt count {0} is neither -1 nor positive")]
    BadSaltCount(i64),
    #[error("holder {0} is not registered for the salt handshake")]
    UnknownHolder(String),
    #[error("multi-worker occurrence join without a salt exchange")]
    NoSaltExchange,
}

/// What one holder added to its relation in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderStats {
    pub table_size: usize,
    pub twins: usize,
    pub markers: usize,
    // occurrence mode only
    pub nmax: usize,
    pub occurrence_controls: usize,
    // select, control tuples, salt handshake and encryption
    pub creation_ms: u64,
}

/// One data owner: reads its relation, adds control tuples, encrypts and
/// ships the result to the computation layer.
pub struct DataHolder<S: RelationStore> {
    name: String,
    store: S,
    twins: TwinGenerator,
    salt_timeout: Duration,
}

impl<S: RelationStore> DataHolder<S> {
    pub fn new(name: impl Into<String>, store: S, salt_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            store,
            twins: TwinGenerator::new(),
            salt_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<id>-<holder>`
    pub fn tid(&self, local_id: &str) -> String {
        format!("{}{}{}", local_id, TID_SEP, self.name)
    }

    fn local_id<'t>(&self, tid: &'t str) -> Option<&'t str> {
        tid.strip_suffix(self.name.as_str())
            .and_then(|s| s.strip_suffix(TID_SEP))
    }

    pub fn handle_query(
        &mut self,
        request: &QueryRequest,
        exchange: Option<&dyn SaltExchange>,
    ) -> Result<(ComputeRequest, HolderStats), HolderError> {
        let timer = howlong::ProcessCPUTimer::new();
        let (entries, mut stats) = self.prepare(request, exchange)?;
        let sealed = self.seal(request, &entries);
        stats.creation_ms = timer.elapsed().real.as_millis() as u64;
        info!(holder = %self.name, ?stats, "control tuples created");
        Ok((sealed, stats))
    }

    /// Plaintext rows to send: real tuples, their twins or occurrence tags,
    /// markers, and salting when the client asks for it.
    pub fn prepare(
        &mut self,
        request: &QueryRequest,
        exchange: Option<&dyn SaltExchange>,
    ) -> Result<(Vec<Entry>, HolderStats), HolderError> {
        let crypto = CryptoBox::new(request.keys.clone());
        let mut stats = HolderStats {
            table_size: self.store.size(),
            ..HolderStats::default()
        };
        let num_workers = request.num_workers();
        let mut real: Vec<RealEntry> = self
            .store
            .select(&request.filter)
            .into_iter()
            .map(|t| RealEntry {
                tid: self.tid(&t.tid),
                key: t.join_value.clone(),
                join_value: t.join_value,
                attr: if request.is_semi_join { None } else { Some(t.attr) },
                occurrence: None,
            })
            .collect();
        info!(holder = %self.name, tuples = real.len(), "relation selected");

        let markers = match MarkerGenerator::new(&crypto, num_workers).generate(request.markers) {
            Ok(set) => set.markers,
            Err(e) => {
                error!(holder = %self.name, error = %e, "markers not generated");
                vec![]
            }
        };

        stats.markers = markers.len();

        let mut occurrences = None;
        let mut twins = vec![];
        if request.use_occurrences {
            let occ = OccurrenceControl::from_counts(self.store.count_by_join_value(&request.filter));
            occ.tag(&mut real);
            stats.nmax = occ.nmax();
            stats.occurrence_controls = occ.repeated();
            occurrences = Some(occ);
        } else if request.uses_twins() {
            twins = match self.twins.generate(&crypto, request, &real) {
                Ok(twins) => twins,
                Err(e) => {
                    error!(holder = %self.name, error = %e, "twins not generated");
                    vec![]
                }
            };
            stats.twins = twins.len();
        }

        let mut entries: Vec<Entry> = real.into_iter().chain(twins).map(Entry::Real).collect();
        entries.extend(markers.into_iter().map(Entry::Marker));

        if let Some(occ) = occurrences.filter(|_| request.needs_salt_count()) {
            let exchange = exchange.ok_or(HolderError::NoSaltExchange)?;
            exchange.report_nmax(&self.name, occ.nmax())?;
            match exchange.await_salt_count(&self.name, self.salt_timeout)? {
                SaltCount::Skip => info!(holder = %self.name, "salting skipped"),
                SaltCount::Salts(s) => {
                    entries = SaltBucketizer::new(&crypto, num_workers).apply(entries, s, occ.nmax());
                }
            }
        }
        Ok((entries, stats))
    }

    pub fn seal(&self, request: &QueryRequest, entries: &[Entry]) -> ComputeRequest {
        let crypto = CryptoBox::new(request.keys.clone());
        let relation: Vec<Pair> = entries
            .par_iter()
            .map(|e| (crypto.encrypt(&e.key()), crypto.encrypt(&e.payload())))
            .collect();
        info!(holder = %self.name, rows = relation.len(), "partial result sealed");
        let query = JoinQueryMessage {
            sender: self.name.clone(),
            join_attribute: 0,
            relation,
        };
        if request.num_workers() > 1 {
            ComputeRequest::Distributed(DistributedJoinQueryMessage {
                query,
                workers: request.workers.clone(),
            })
        } else {
            ComputeRequest::Single(query)
        }
    }

    pub fn answer(&self, request: &SemiJoinRequest) -> SemiJoinResponse {
        SemiJoinResponse {
            rows: self.semi_join(&request.tids),
        }
    }
}

impl<S: RelationStore> SemiJoinSource for DataHolder<S> {
    fn semi_join(&self, tids: &[String]) -> BTreeMap<String, (String, String)> {
        let local: Vec<String> = tids
            .iter()
            .filter_map(|t| self.local_id(t))
            .map(|t| t.to_string())
            .collect();
        self.store
            .fetch_by_tids(&local)
            .into_iter()
            .map(|t| (self.tid(&t.tid), (t.join_value, t.attr)))
            .collect()
    }
}
