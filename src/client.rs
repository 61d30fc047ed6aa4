use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender},
        Mutex,
    },
    time::Duration,
};

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::ClientConfig,
    crypto::KeyMaterial,
    holder::HolderError,
    message::{NmaxReport, QueryRequest, SaltCount},
    traits::{SaltExchange, SemiJoinSource},
    verify::{ResultVerifier, VerifiedRow},
    HOLDER_L,
};

/// `-1` (skip) unless one side is the "1" of a 1:n join, otherwise
/// `ceil(sqrt(max nmax))`.
pub fn compute_salt_count(nmaxes: &[usize]) -> SaltCount {
    if !nmaxes.contains(&1) {
        return SaltCount::Skip;
    }
    let nmax = nmaxes.iter().copied().max().unwrap_or(1);
    SaltCount::Salts(((nmax as f64).sqrt().ceil() as usize).max(1))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JoinedRow {
    pub tid_l: String,
    pub join_l: String,
    pub attr_l: String,
    pub tid_r: String,
    pub join_r: String,
    pub attr_r: String,
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn build_request(&self, holder: &str, keys: &KeyMaterial) -> QueryRequest {
        let filter = if holder == HOLDER_L {
            self.config.filter_l.clone()
        } else {
            self.config.filter_r.clone()
        };
        QueryRequest {
            filter,
            markers: self.config.markers,
            replication_factor: self.config.replication_factor,
            twin_condition: self.config.twin_condition.clone(),
            workers: self.config.workers.clone(),
            keys: keys.clone(),
            use_occurrences: self.config.use_occurrences,
            is_semi_join: self.config.is_semi_join,
            min_salt_length: self.config.min_salt_length,
        }
    }

    pub fn verifier(&self, keys: &KeyMaterial) -> ResultVerifier {
        ResultVerifier::new(&self.build_request(HOLDER_L, keys))
    }

    /// Turns verified rows into full joined tuples, asking the holders for
    /// the payloads when only keys were shipped.
    pub fn complete(
        &self,
        rows: &[VerifiedRow],
        left: &dyn SemiJoinSource,
        right: &dyn SemiJoinSource,
    ) -> Result<Vec<JoinedRow>> {
        if !self.config.is_semi_join {
            return rows
                .iter()
                .map(|r| match (&r.left.attr, &r.right.attr) {
                    (Some(al), Some(ar)) => Ok(JoinedRow {
                        tid_l: r.left.tid.clone(),
                        join_l: r.left.join_value.clone(),
                        attr_l: al.clone(),
                        tid_r: r.right.tid.clone(),
                        join_r: r.right.join_value.clone(),
                        attr_r: ar.clone(),
                    }),
                    _ => bail!("row {} carries no payload", r.join_value),
                })
                .collect();
        }

        let tids_l: BTreeSet<String> = rows.iter().map(|r| r.left.tid.clone()).collect();
        let tids_r: BTreeSet<String> = rows.iter().map(|r| r.right.tid.clone()).collect();
        let fetched_l = left.semi_join(&tids_l.into_iter().collect::<Vec<_>>());
        let fetched_r = right.semi_join(&tids_r.into_iter().collect::<Vec<_>>());
        info!(left = fetched_l.len(), right = fetched_r.len(), "semi-join payloads fetched");

        let mut res = Vec::with_capacity(rows.len());
        for r in rows {
            let (Some((join_l, attr_l)), Some((join_r, attr_r))) =
                (fetched_l.get(&r.left.tid), fetched_r.get(&r.right.tid))
            else {
                bail!("missing semi-join payload for {} / {}", r.left.tid, r.right.tid);
            };
            ensure!(
                join_l == join_r && *join_l == r.join_value,
                "semi-join values disagree for {} / {}",
                r.left.tid,
                r.right.tid
            );
            res.push(JoinedRow {
                tid_l: r.left.tid.clone(),
                join_l: join_l.clone(),
                attr_l: attr_l.clone(),
                tid_r: r.right.tid.clone(),
                join_r: join_r.clone(),
                attr_r: attr_r.clone(),
            });
        }
        Ok(res)
    }
}

struct SaltState {
    reports: BTreeMap<String, usize>,
    // salt counts travel in their wire form
    senders: HashMap<String, SyncSender<i64>>,
    receivers: HashMap<String, Receiver<i64>>,
}

/// Client side of the salt handshake for one query run: once every holder
/// has reported its `nmax`, the salt count is pushed to all of them.
pub struct SaltCoordinator {
    state: Mutex<SaltState>,
}

impl SaltCoordinator {
    pub fn new(holders: &[&str]) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for h in holders {
            let (tx, rx) = sync_channel(1);
            senders.insert(h.to_string(), tx);
            receivers.insert(h.to_string(), rx);
        }
        Self {
            state: Mutex::new(SaltState {
                reports: BTreeMap::new(),
                senders,
                receivers,
            }),
        }
    }

    pub fn on_report(&self, report: NmaxReport) -> Result<(), HolderError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.senders.contains_key(&report.holder) {
            return Err(HolderError::UnknownHolder(report.holder));
        }
        debug!(holder = %report.holder, nmax = report.nmax, "nmax received");
        state.reports.insert(report.holder, report.nmax);
        if state.reports.len() < state.senders.len() {
            return Ok(());
        }
        let nmaxes: Vec<usize> = state.reports.values().copied().collect();
        let s = compute_salt_count(&nmaxes);
        info!(nmax = ?nmaxes, s = s.to_wire(), "salt count published");
        state.reports.clear();
        for (holder, tx) in &state.senders {
            tx.try_send(s.to_wire())
                .map_err(|_| HolderError::SaltChannelClosed(holder.clone()))?;
        }
        Ok(())
    }
}

impl SaltExchange for SaltCoordinator {
    fn report_nmax(&self, holder: &str, nmax: usize) -> Result<(), HolderError> {
        self.on_report(NmaxReport {
            holder: holder.to_string(),
            nmax,
        })
    }

    fn await_salt_count(&self, holder: &str, timeout: Duration) -> Result<SaltCount, HolderError> {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .receivers
                .remove(holder)
                .ok_or_else(|| HolderError::UnknownHolder(holder.to_string()))?
        };
        let wire = rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => HolderError::SaltTimeout {
                holder: holder.to_string(),
                waited_ms: timeout.as_millis() as u64,
            },
            RecvTimeoutError::Disconnected => HolderError::SaltChannelClosed(holder.to_string()),
        })?;
        SaltCount::from_wire(wire).ok_or(HolderError::BadSaltCount(wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{verify::Side, HOLDER_R};
    use std::thread;

    #[test]
    fn test_compute_salt_count() {
        assert_eq!(compute_salt_count(&[1, 10]), SaltCount::Salts(4));
        assert_eq!(compute_salt_count(&[9, 1]), SaltCount::Salts(3));
        assert_eq!(compute_salt_count(&[1, 1]), SaltCount::Salts(1));
        assert_eq!(compute_salt_count(&[2, 5]), SaltCount::Skip);
    }

    #[test]
    fn test_handshake_between_threads() {
        let coordinator = SaltCoordinator::new(&[HOLDER_L, HOLDER_R]);
        let timeout = Duration::from_secs(5);
        let (l, r) = thread::scope(|s| {
            let hl = s.spawn(|| {
                coordinator.report_nmax(HOLDER_L, 1).unwrap();
                coordinator.await_salt_count(HOLDER_L, timeout)
            });
            let hr = s.spawn(|| {
                coordinator.report_nmax(HOLDER_R, 16).unwrap();
                coordinator.await_salt_count(HOLDER_R, timeout)
            });
            (hl.join().unwrap(), hr.join().unwrap())
        });
        assert_eq!(l, Ok(SaltCount::Salts(4)));
        assert_eq!(r, Ok(SaltCount::Salts(4)));
    }

    #[test]
    fn test_handshake_times_out() {
        let coordinator = SaltCoordinator::new(&[HOLDER_L, HOLDER_R]);
        coordinator.report_nmax(HOLDER_L, 3).unwrap();
        let res = coordinator.await_salt_count(HOLDER_L, Duration::from_millis(20));
        assert!(matches!(res, Err(HolderError::SaltTimeout { .. })));
        assert_eq!(
            coordinator.report_nmax("X", 1),
            Err(HolderError::UnknownHolder("X".to_string()))
        );
    }

    #[test]
    fn test_malformed_salt_count_is_rejected() {
        let coordinator = SaltCoordinator::new(&[HOLDER_L]);
        {
            let state = coordinator.state.lock().unwrap();
            state.senders[HOLDER_L].try_send(0).unwrap();
        }
        assert_eq!(
            coordinator.await_salt_count(HOLDER_L, Duration::from_secs(1)),
            Err(HolderError::BadSaltCount(0))
        );

        let coordinator = SaltCoordinator::new(&[HOLDER_L]);
        coordinator.report_nmax(HOLDER_L, 1).unwrap();
        assert_eq!(
            coordinator.await_salt_count(HOLDER_L, Duration::from_secs(1)),
            Ok(SaltCount::Salts(1))
        );
    }

    struct Fixed(BTreeMap<String, (String, String)>);

    impl SemiJoinSource for Fixed {
        fn semi_join(&self, tids: &[String]) -> BTreeMap<String, (String, String)> {
            tids.iter()
                .filter_map(|t| self.0.get(t).map(|v| (t.clone(), v.clone())))
                .collect()
        }
    }

    fn row(v: &str, tl: &str, tr: &str) -> VerifiedRow {
        let side = |tid: &str| Side {
            tid: tid.to_string(),
            join_value: v.to_string(),
            attr: None,
        };
        VerifiedRow {
            join_value: v.to_string(),
            left: side(tl),
            right: side(tr),
        }
    }

    #[test]
    fn test_semi_join_completion() {
        let mut config = ClientConfig::default();
        config.is_semi_join = true;
        let client = Client::new(config);
        let left = Fixed(
            [("1-L".to_string(), ("a".to_string(), "x".to_string()))]
                .into_iter()
                .collect(),
        );
        let right = Fixed(
            [
                ("4-R".to_string(), ("a".to_string(), "y".to_string())),
                ("5-R".to_string(), ("b".to_string(), "z".to_string())),
            ]
            .into_iter()
            .collect(),
        );
        let res = client.complete(&[row("a", "1-L", "4-R")], &left, &right).unwrap();
        assert_eq!(res[0].attr_l, "x");
        assert_eq!(res[0].attr_r, "y");

        assert!(client.complete(&[row("a", "1-L", "5-R")], &left, &right).is_err());
        assert!(client.complete(&[row("a", "2-L", "4-R")], &left, &right).is_err());
    }

    #[test]
    fn test_build_request_uses_holder_filter() {
        let mut config = ClientConfig::default();
        config.filter_r = crate::relation::QueryFilter::JoinValueIn(["a".to_string()].into_iter().collect());
        let client = Client::new(config);
        let keys = KeyMaterial::generate(&mut crate::utils::get_fixed_rng());
        assert_eq!(client.build_request(HOLDER_L, &keys).filter, crate::relation::QueryFilter::All);
        assert_ne!(client.build_request(HOLDER_R, &keys).filter, crate::relation::QueryFilter::All);
    }
}
