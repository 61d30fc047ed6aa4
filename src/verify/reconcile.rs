use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;

use super::clean::{CleanRow, VerifiedRow};
use crate::{
    control::{is_twin_candidate, Marker},
    crypto::CryptoBox,
    message::{Triple, TwinCondition},
};

#[derive(Debug, Default)]
pub struct MarkerOutcome {
    pub removed: usize,
    pub missing: Vec<Marker>,
    pub unexpected: Vec<Triple>,
}

/// Removes every marker row by exact match against the expected set.
pub fn reconcile_markers(expected: &[Marker], rows: Vec<Triple>) -> MarkerOutcome {
    let mut remaining: BTreeSet<Marker> = expected.iter().copied().collect();
    let by_value: HashMap<String, Marker> = expected.iter().map(|m| (m.value(), *m)).collect();
    let mut outcome = MarkerOutcome::default();
    for (key, left, right) in rows {
        match by_value.get(&key) {
            Some(m) if m.matches(&key, &left, &right) && remaining.remove(m) => {
                outcome.removed += 1;
            }
            _ => outcome.unexpected.push((key, left, right)),
        }
    }
    outcome.missing = remaining.into_iter().collect();
    outcome
}

#[derive(Debug, Default)]
pub struct TwinOutcome {
    pub rows: Vec<VerifiedRow>,
    pub removed: usize,
    pub outstanding: Vec<(VerifiedRow, usize)>,
}

/// Every twinned row must come back exactly `replication_factor` times; a
/// full group collapses to the single real row.
pub fn reconcile_twins(
    rows: Vec<CleanRow>,
    condition: &TwinCondition,
    crypto: &CryptoBox,
    replication_factor: usize,
) -> TwinOutcome {
    let r = replication_factor.max(1);
    let mut outcome = TwinOutcome::default();
    let mut candidates = vec![];
    let mut selected: HashMap<String, bool> = HashMap::new();
    for c in rows {
        let twinned = *selected
            .entry(c.row.join_value.clone())
            .or_insert_with(|| is_twin_candidate(condition, crypto, &c.row.join_value));
        if twinned && r > 1 {
            candidates.push(c.row);
        } else {
            outcome.rows.push(c.row);
        }
    }

    let groups: BTreeMap<VerifiedRow, usize> = candidates.into_iter().counts().into_iter().collect();
    for (row, count) in groups {
        let full = count / r;
        let rest = count % r;
        outcome.removed += full * (r - 1);
        if rest > 0 {
            outcome.outstanding.push((row.clone(), rest));
        }
        for _ in 0..full {
            outcome.rows.push(row.clone());
        }
    }
    outcome
}

/// `expected - observed` for every logical value whose row count disagrees
/// with the product of the tagged multiplicities.
pub fn reconcile_occurrences(rows: &[CleanRow]) -> BTreeMap<String, i64> {
    let mut tally: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for c in rows {
        let claimed = c.occurrences.map(|(l, r)| l * r).unwrap_or(0);
        let entry = tally.entry(c.row.join_value.as_str()).or_insert((claimed, 0));
        entry.1 += 1;
    }
    tally
        .into_iter()
        .filter(|(_, (expected, observed))| expected != observed)
        .map(|(v, (expected, observed))| (v.to_string(), expected as i64 - observed as i64))
        .collect()
}
