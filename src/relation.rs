use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::traits::RelationStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub tid: String,
    pub join_value: String,
    pub attr: String,
}

impl Tuple {
    pub fn new(tid: impl Into<String>, join_value: impl Into<String>, attr: impl Into<String>) -> Self {
        Self {
            tid: tid.into(),
            join_value: join_value.into(),
            attr: attr.into(),
        }
    }
}

/// Selection applied by the store before a relation leaves its holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QueryFilter {
    #[default]
    All,
    JoinValueIn(BTreeSet<String>),
    AttributeIn(BTreeSet<String>),
}

impl QueryFilter {
    pub fn matches(&self, t: &Tuple) -> bool {
        match self {
            QueryFilter::All => true,
            QueryFilter::JoinValueIn(values) => values.contains(&t.join_value),
            QueryFilter::AttributeIn(values) => values.contains(&t.attr),
        }
    }
}

/// In-memory table `(ID, joinValue, attr)` with ids assigned from 1.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Relation {
    tuples: Vec<Tuple>,
}

impl Relation {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self { tuples }
    }

    pub fn from_pairs<S: AsRef<str>>(pairs: &[(S, S)]) -> Self {
        let tuples = pairs
            .iter()
            .enumerate()
            .map(|(i, (v, a))| Tuple::new((i + 1).to_string(), v.as_ref(), a.as_ref()))
            .collect();
        Self { tuples }
    }

    pub fn push(&mut self, join_value: impl Into<String>, attr: impl Into<String>) {
        let tid = (self.tuples.len() + 1).to_string();
        self.tuples.push(Tuple::new(tid, join_value, attr));
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn get_size(&self) -> usize {
        self.tuples.len()
    }

    pub fn distinct_join_values(&self) -> HashSet<&str> {
        self.tuples.iter().map(|t| t.join_value.as_str()).collect()
    }

    /// Plaintext equi-join, used as ground truth for verified results.
    /// Rows are `(joinValue, tidSelf, tidOther)`.
    pub fn local_join(&self, other: &Relation) -> Vec<(String, String, String)> {
        let mut index: HashMap<&str, Vec<&Tuple>> = HashMap::new();
        for t in &other.tuples {
            index.entry(t.join_value.as_str()).or_default().push(t);
        }
        let mut res = vec![];
        for t in &self.tuples {
            if let Some(matches) = index.get(t.join_value.as_str()) {
                for m in matches {
                    res.push((t.join_value.clone(), t.tid.clone(), m.tid.clone()));
                }
            }
        }
        res.sort();
        res
    }
}

impl RelationStore for Relation {
    fn select(&self, filter: &QueryFilter) -> Vec<Tuple> {
        self.tuples
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    fn fetch_by_tids(&self, tids: &[String]) -> Vec<Tuple> {
        let wanted: HashSet<&str> = tids.iter().map(|t| t.as_str()).collect();
        self.tuples
            .iter()
            .filter(|t| wanted.contains(t.tid.as_str()))
            .cloned()
            .collect()
    }

    fn size(&self) -> usize {
        self.tuples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_with_filter() {
        let r = Relation::from_pairs(&[("Jerrie", "69"), ("Ilsa", "23"), ("Jerrie", "40")]);
        assert_eq!(r.select(&QueryFilter::All).len(), 3);

        let f = QueryFilter::JoinValueIn(["Jerrie".to_string()].into_iter().collect());
        let sel = r.select(&f);
        assert_eq!(sel.len(), 2);
        assert_eq!(sel[0].tid, "1");
        assert_eq!(sel[1].tid, "3");

        let f = QueryFilter::AttributeIn(["23".to_string()].into_iter().collect());
        assert_eq!(r.select(&f)[0].join_value, "Ilsa");
    }

    #[test]
    fn test_count_by_join_value() {
        let r = Relation::from_pairs(&[("a", "1"), ("b", "2"), ("a", "3"), ("a", "4")]);
        let counts = r.count_by_join_value(&QueryFilter::All);
        assert_eq!(counts["a"], 3);
        assert_eq!(counts["b"], 1);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_fetch_by_tids() {
        let mut r = Relation::default();
        r.push("a", "x");
        r.push("b", "y");
        r.push("c", "z");
        let got = r.fetch_by_tids(&["3".to_string(), "1".to_string(), "9".to_string()]);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].attr, "x");
        assert_eq!(got[1].attr, "z");
    }

    #[test]
    fn test_local_join() {
        let r1 = Relation::from_pairs(&[("1", "a"), ("2", "b"), ("1", "c")]);
        let r2 = Relation::from_pairs(&[("1", "a"), ("3", "b")]);
        let res = r1.local_join(&r2);
        assert_eq!(
            res,
            vec![
                ("1".to_string(), "1".to_string(), "1".to_string()),
                ("1".to_string(), "3".to_string(), "1".to_string()),
            ]
        );
        assert!(r2.local_join(&Relation::default()).is_empty());
    }
}
