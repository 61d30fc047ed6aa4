//! Client-side reassembly and verification of join results.

pub mod clean;
pub mod reconcile;

pub use clean::{Side, VerifiedRow};

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use self::{
    clean::{twin_salt_pattern, CleanRow, DecodedRow, RowDecoder},
    reconcile::{reconcile_markers, reconcile_occurrences, reconcile_twins},
};
use crate::{
    control::{Marker, MarkerGenerator},
    crypto::CryptoBox,
    message::{QueryRequest, ResultFragment, Triple, TwinCondition},
};

/// What the verifier measured on one result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub result_rows: usize,
    pub control_tuples: usize,
    // plaintext bytes of markers, twins and dummies
    pub control_tuples_size: usize,
    // decrypt + clean + reconcile
    pub check_integrity_ms: u64,
    pub tampering: bool,
    pub integrity_error: bool,
}

impl RunStats {
    /// Zero-valued record reported for a tampered run.
    pub fn tampering_sentinel() -> Self {
        Self {
            tampering: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedResult {
    pub rows: Vec<VerifiedRow>,
    pub stats: RunStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViolationReport {
    pub missing_markers: Vec<Marker>,
    pub unexpected_markers: Vec<Triple>,
    pub outstanding_twins: Vec<(VerifiedRow, usize)>,
    pub occurrence_mismatches: BTreeMap<String, i64>,
    pub stats: RunStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Incomplete,
    Verified(VerifiedResult),
    Violation(ViolationReport),
    Tampering { reason: String, stats: RunStats },
}

impl Verdict {
    pub fn is_complete(&self) -> bool {
        !matches!(self, Verdict::Incomplete)
    }
}

#[derive(Debug, Default)]
struct VerificationState {
    fragments: BTreeMap<usize, Vec<Triple>>,
    expected_total: Option<usize>,
}

/// Collects fragments of one query run and reconciles them once all have
/// arrived. Safe to feed from several threads; the fragment that completes
/// the count takes the whole state, so reconciliation runs once.
pub struct ResultVerifier {
    crypto: CryptoBox,
    expected_markers: Vec<Marker>,
    twin_condition: TwinCondition,
    replication_factor: usize,
    use_twins: bool,
    use_occurrences: bool,
    is_semi_join: bool,
    twin_pattern: Option<Regex>,
    state: Mutex<VerificationState>,
}

impl ResultVerifier {
    pub fn new(request: &QueryRequest) -> Self {
        let crypto = CryptoBox::new(request.keys.clone());
        // the holders run the same generator; a failure there means no markers were sent
        let expected_markers = match MarkerGenerator::new(&crypto, request.num_workers())
            .generate(request.markers)
        {
            Ok(set) => set.markers,
            Err(e) => {
                warn!(error = %e, "no markers expected");
                vec![]
            }
        };
        let use_twins = request.uses_twins() && request.min_salt_length > 0;
        let twin_pattern = if use_twins {
            match twin_salt_pattern(request.min_salt_length) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!(error = %e, "bad twin salt pattern");
                    None
                }
            }
        } else {
            None
        };
        Self {
            crypto,
            expected_markers,
            twin_condition: request.twin_condition.clone(),
            replication_factor: request.replication_factor,
            use_twins,
            use_occurrences: request.use_occurrences,
            is_semi_join: request.is_semi_join,
            twin_pattern,
            state: Mutex::new(VerificationState::default()),
        }
    }

    pub fn expected_markers(&self) -> &[Marker] {
        &self.expected_markers
    }

    fn lock_state(&self) -> MutexGuard<'_, VerificationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_fragment(&self, fragment: ResultFragment) -> Verdict {
        let rows = {
            let mut state = self.lock_state();
            let total = *state
                .expected_total
                .get_or_insert(fragment.number_of_fragments);
            if total != fragment.number_of_fragments {
                warn!(
                    id = fragment.id,
                    declared = fragment.number_of_fragments,
                    expected = total,
                    "fragment declares a different total"
                );
            }
            debug!(id = fragment.id, rows = fragment.rows.len(), "fragment received");
            state.fragments.insert(fragment.id, fragment.rows);
            if state.fragments.len() < total {
                return Verdict::Incomplete;
            }
            let done = std::mem::take(&mut *state);
            done.fragments.into_values().flatten().collect::<Vec<Triple>>()
        };
        info!(rows = rows.len(), "all fragments received");
        self.verify(rows)
    }

    /// Decrypts, cleans and reconciles a complete result.
    pub fn verify(&self, rows: Vec<Triple>) -> Verdict {
        let timer = howlong::ProcessCPUTimer::new();
        let decoder = RowDecoder {
            crypto: &self.crypto,
            twin_pattern: self.twin_pattern.as_ref(),
            bucket_salts: self.use_occurrences,
            is_semi_join: self.is_semi_join,
            use_occurrences: self.use_occurrences,
        };

        let mut markers = vec![];
        let mut real: Vec<CleanRow> = vec![];
        let mut dummies = 0;
        let mut control_tuples_size = 0;
        for row in &rows {
            match decoder.decode(row) {
                Ok(DecodedRow::Marker(m)) => {
                    control_tuples_size += m.0.len() + m.1.len() + m.2.len();
                    markers.push(m);
                }
                Ok(DecodedRow::Dummy(size)) => {
                    dummies += 1;
                    control_tuples_size += size;
                }
                Ok(DecodedRow::Real(c)) => real.push(c),
                Err(reason) => {
                    error!(reason = %reason, "tampering detected");
                    return Verdict::Tampering {
                        reason,
                        stats: RunStats::tampering_sentinel(),
                    };
                }
            }
        }

        let marker_outcome = reconcile_markers(&self.expected_markers, markers);
        let mut report = ViolationReport {
            missing_markers: marker_outcome.missing,
            unexpected_markers: marker_outcome.unexpected,
            ..ViolationReport::default()
        };
        let mut control_tuples = marker_outcome.removed + dummies;

        let verified = if self.use_occurrences {
            report.occurrence_mismatches = reconcile_occurrences(&real);
            real.into_iter().map(|c| c.row).collect::<Vec<_>>()
        } else if self.use_twins {
            let before: usize = real.iter().map(|c| c.row.byte_size()).sum();
            let outcome = reconcile_twins(
                real,
                &self.twin_condition,
                &self.crypto,
                self.replication_factor,
            );
            control_tuples += outcome.removed;
            control_tuples_size += before - outcome.rows.iter().map(VerifiedRow::byte_size).sum::<usize>();
            report.outstanding_twins = outcome.outstanding;
            outcome.rows
        } else {
            real.into_iter().map(|c| c.row).collect()
        };

        let stats = RunStats {
            result_rows: verified.len(),
            control_tuples,
            control_tuples_size,
            check_integrity_ms: timer.elapsed().real.as_millis() as u64,
            tampering: false,
            integrity_error: false,
        };
        let clean = report.missing_markers.is_empty()
            && report.unexpected_markers.is_empty()
            && report.outstanding_twins.is_empty()
            && report.occurrence_mismatches.is_empty();
        if clean {
            info!(rows = stats.result_rows, control = stats.control_tuples, "result verified");
            Verdict::Verified(VerifiedResult {
                rows: verified,
                stats,
            })
        } else {
            report.stats = RunStats {
                integrity_error: true,
                ..stats
            };
            error!(
                missing_markers = report.missing_markers.len(),
                unexpected_markers = report.unexpected_markers.len(),
                outstanding_twins = report.outstanding_twins.len(),
                occurrence_mismatches = report.occurrence_mismatches.len(),
                "integrity violation"
            );
            Verdict::Violation(report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::KeyMaterial, message::MarkerPolicy, relation::QueryFilter, utils::get_fixed_rng,
    };
    use rayon::prelude::*;

    fn request(markers: MarkerPolicy, r: usize, twin_values: &[&str]) -> QueryRequest {
        QueryRequest {
            filter: QueryFilter::All,
            markers,
            replication_factor: r,
            twin_condition: TwinCondition::Values(twin_values.iter().map(|s| s.to_string()).collect()),
            workers: vec!["w0".to_string(), "w1".to_string()],
            keys: KeyMaterial::generate(&mut get_fixed_rng()),
            use_occurrences: false,
            is_semi_join: false,
            min_salt_length: 3,
        }
    }

    fn enc(crypto: &CryptoBox, k: &str, l: &str, r: &str) -> Triple {
        (crypto.encrypt(k), crypto.encrypt(l), crypto.encrypt(r))
    }

    #[test]
    fn test_fragments_out_of_order() {
        let req = request(MarkerPolicy::default(), 1, &[]);
        let crypto = CryptoBox::new(req.keys.clone());
        let verifier = ResultVerifier::new(&req);
        let f = |id: usize, v: &str| ResultFragment {
            id,
            number_of_fragments: 3,
            rows: vec![enc(&crypto, v, &format!("1-L|{}|a", v), &format!("1-R|{}|b", v))],
        };
        assert_eq!(verifier.on_fragment(f(2, "x")), Verdict::Incomplete);
        assert_eq!(verifier.on_fragment(f(0, "y")), Verdict::Incomplete);
        // a duplicate does not complete the count
        assert_eq!(verifier.on_fragment(f(0, "y")), Verdict::Incomplete);
        let Verdict::Verified(res) = verifier.on_fragment(f(1, "z")) else {
            panic!("expected verified result");
        };
        assert_eq!(res.rows.len(), 3);
        assert_eq!(res.stats.control_tuples, 0);
    }

    #[test]
    fn test_concurrent_completion_runs_once() {
        let req = request(MarkerPolicy::default(), 1, &[]);
        let crypto = CryptoBox::new(req.keys.clone());
        let verifier = ResultVerifier::new(&req);
        let fragments: Vec<ResultFragment> = (0..16)
            .map(|id| ResultFragment {
                id,
                number_of_fragments: 16,
                rows: vec![enc(&crypto, "v", &format!("{}-L|v|a", id), "1-R|v|b")],
            })
            .collect();
        let verdicts: Vec<Verdict> = fragments
            .into_par_iter()
            .map(|f| verifier.on_fragment(f))
            .collect();
        assert_eq!(verdicts.iter().filter(|v| v.is_complete()).count(), 1);
    }

    #[test]
    fn test_markers_and_twins() {
        let policy = MarkerPolicy { n: 3, n_min: 1, n_max: 2 };
        let req = request(policy, 2, &["a"]);
        let crypto = CryptoBox::new(req.keys.clone());
        let verifier = ResultVerifier::new(&req);
        assert_eq!(verifier.expected_markers().len(), 3);

        let mut rows: Vec<Triple> = verifier
            .expected_markers()
            .iter()
            .map(|m| enc(&crypto, &m.value(), &m.payload(), &m.payload()))
            .collect();
        rows.push(enc(&crypto, "a", "1-L|a|x", "1-R|a|y"));
        rows.push(enc(&crypto, "a-00", "1-L|a|x", "1-R|a|y"));
        rows.push(enc(&crypto, "b", "2-L|b|x", "2-R|b|y"));

        let Verdict::Verified(res) = verifier.verify(rows.clone()) else {
            panic!("expected verified result");
        };
        assert_eq!(res.rows.len(), 2);
        assert_eq!(res.stats.control_tuples, 4);
        let marker_bytes: usize = verifier
            .expected_markers()
            .iter()
            .map(|m| m.value().len() + 2 * m.payload().len())
            .sum();
        // the removed twin is a copy of the kept "a" row
        let twin_bytes = res.rows.iter().find(|r| r.join_value == "a").unwrap().byte_size();
        assert_eq!(twin_bytes, 11);
        assert_eq!(res.stats.control_tuples_size, marker_bytes + twin_bytes);

        // a lost twin and a lost marker
        rows.remove(0);
        rows.retain(|r| r.0 != crypto.encrypt("a-00"));
        let Verdict::Violation(report) = verifier.verify(rows) else {
            panic!("expected violation");
        };
        assert_eq!(report.missing_markers.len(), 1);
        assert_eq!(report.outstanding_twins.len(), 1);
        assert!(report.stats.integrity_error);
    }

    #[test]
    fn test_tampered_row() {
        let req = request(MarkerPolicy::default(), 1, &[]);
        let crypto = CryptoBox::new(req.keys.clone());
        let verifier = ResultVerifier::new(&req);
        let (k, l, r) = enc(&crypto, "a", "1-L|a|x", "1-R|a|y");
        let verdict = verifier.verify(vec![(k + "-20981", l, r)]);
        assert!(matches!(
            verdict,
            Verdict::Tampering { stats, .. } if stats == RunStats::tampering_sentinel()
        ));
    }
}
