use std::collections::HashMap;

use tracing::info;

use super::RealEntry;

/// Multiplicity of every join value in the filtered relation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccurrenceControl {
    counts: HashMap<String, usize>,
    nmax: usize,
}

impl OccurrenceControl {
    pub fn from_counts(counts: HashMap<String, usize>) -> Self {
        let nmax = counts.values().copied().max().unwrap_or(0);
        info!(distinct = counts.len(), nmax, "occurrences computed");
        Self { counts, nmax }
    }

    pub fn nmax(&self) -> usize {
        self.nmax
    }

    // join values occurring more than once
    pub fn repeated(&self) -> usize {
        self.counts.values().filter(|c| **c > 1).count()
    }

    pub fn count(&self, join_value: &str) -> usize {
        self.counts.get(join_value).copied().unwrap_or(0)
    }

    /// Tags every entry with the multiplicity of its own join value.
    pub fn tag(&self, entries: &mut [RealEntry]) {
        for e in entries.iter_mut() {
            e.occurrence = Some(self.count(&e.join_value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_and_nmax() {
        let counts: HashMap<String, usize> =
            [("a".to_string(), 3), ("b".to_string(), 1)].into_iter().collect();
        let occ = OccurrenceControl::from_counts(counts);
        assert_eq!(occ.nmax(), 3);
        assert_eq!(occ.repeated(), 1);
        assert_eq!(occ.count("c"), 0);

        let mut entries: Vec<RealEntry> = ["a", "b"]
            .iter()
            .enumerate()
            .map(|(i, v)| RealEntry {
                tid: format!("{}-R", i + 1),
                key: v.to_string(),
                join_value: v.to_string(),
                attr: None,
                occurrence: None,
            })
            .collect();
        occ.tag(&mut entries);
        assert_eq!(entries[0].payload(), "1-R|a|3");
        assert_eq!(entries[1].payload(), "2-R|b|1");
    }

    #[test]
    fn test_empty_relation() {
        let occ = OccurrenceControl::from_counts(HashMap::new());
        assert_eq!(occ.nmax(), 0);
        assert_eq!(occ.repeated(), 0);
    }
}
