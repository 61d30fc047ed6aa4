use std::collections::HashMap;

use rand::{rngs::StdRng, Rng};
use tracing::debug;

use super::partition::{join_key, other_value};
use crate::message::{Pair, Triple};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultProfile {
    pub tampering_probability: f64,
    pub lazy_probability: f64,
}

impl FaultProfile {
    pub fn honest() -> Self {
        Self {
            tampering_probability: 0.0,
            lazy_probability: 0.0,
        }
    }

    pub fn is_honest(&self) -> bool {
        self.tampering_probability == 0.0 && self.lazy_probability == 0.0
    }
}

/// Hash join of two encrypted relations with per-row fault injection: a row
/// is dropped with the lazy probability, otherwise one of its three fields
/// gets a random number appended with the tampering probability.
pub fn hash_join(
    left: &[Pair],
    left_attribute: usize,
    right: &[Pair],
    right_attribute: usize,
    faults: FaultProfile,
    rng: &mut StdRng,
) -> Vec<Triple> {
    assert!(
        (0.0..=1.0).contains(&faults.tampering_probability)
            && (0.0..=1.0).contains(&faults.lazy_probability),
        "fault probabilities out of range: {:?}",
        faults
    );

    let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
    for p in left {
        index
            .entry(join_key(p, left_attribute))
            .or_default()
            .push(other_value(p, left_attribute));
    }

    let mut res = vec![];
    let mut dropped = 0;
    let mut tampered = 0;
    for t in right {
        let key = join_key(t, right_attribute);
        let Some(candidates) = index.get(key) else {
            continue;
        };
        let right_value = other_value(t, right_attribute);
        for left_value in candidates {
            if faults.is_honest() {
                res.push((key.to_string(), left_value.to_string(), right_value.to_string()));
                continue;
            }
            if rng.gen::<f64>() < faults.lazy_probability {
                dropped += 1;
                continue;
            }
            let row = (key.to_string(), left_value.to_string(), right_value.to_string());
            if rng.gen::<f64>() < faults.tampering_probability {
                tampered += 1;
                res.push(tamper(row, rng));
            } else {
                res.push(row);
            }
        }
    }
    if dropped > 0 || tampered > 0 {
        debug!(dropped, tampered, rows = res.len(), "faults injected");
    }
    res
}

fn tamper(row: Triple, rng: &mut StdRng) -> Triple {
    let suffix = rng.gen::<i32>().to_string();
    let (key, left, right) = row;
    match rng.gen_range(0..3) {
        0 => (key + &suffix, left, right),
        1 => (key, left + &suffix, right),
        _ => (key, left, right + &suffix),
    }
}

/// One member of the worker pool holding its own partition of both sides.
pub struct Worker {
    pub index: usize,
    pub id: String,
    pub trusted: bool,
    faults: FaultProfile,
    rng: StdRng,
}

impl Worker {
    pub fn new(index: usize, id: String, trusted: bool, faults: FaultProfile, rng: StdRng) -> Self {
        let faults = if trusted { FaultProfile::honest() } else { faults };
        Self {
            index,
            id,
            trusted,
            faults,
            rng,
        }
    }

    pub fn run(
        &mut self,
        left: &[Pair],
        left_attribute: usize,
        right: &[Pair],
        right_attribute: usize,
    ) -> Vec<Triple> {
        let res = hash_join(
            left,
            left_attribute,
            right,
            right_attribute,
            self.faults,
            &mut self.rng,
        );
        debug!(
            worker = %self.id,
            trusted = self.trusted,
            left = left.len(),
            right = right.len(),
            rows = res.len(),
            "worker done"
        );
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::get_fixed_rng;

    fn pairs(v: &[(&str, &str)]) -> Vec<Pair> {
        v.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn test_honest_join() {
        let l = pairs(&[("k1", "l1"), ("k2", "l2"), ("k1", "l3")]);
        let r = pairs(&[("k1", "r1"), ("k3", "r3")]);
        let mut rng = get_fixed_rng();
        let mut res = hash_join(&l, 0, &r, 0, FaultProfile::honest(), &mut rng);
        res.sort();
        assert_eq!(
            res,
            vec![
                ("k1".to_string(), "l1".to_string(), "r1".to_string()),
                ("k1".to_string(), "l3".to_string(), "r1".to_string()),
            ]
        );
    }

    #[test]
    fn test_join_attribute_on_second_position() {
        let l = pairs(&[("l1", "k1")]);
        let r = pairs(&[("k1", "r1")]);
        let res = hash_join(&l, 1, &r, 0, FaultProfile::honest(), &mut get_fixed_rng());
        assert_eq!(res, vec![("k1".to_string(), "l1".to_string(), "r1".to_string())]);
    }

    #[test]
    fn test_lazy_drops_everything() {
        let l = pairs(&[("k1", "l1"), ("k2", "l2")]);
        let r = pairs(&[("k1", "r1"), ("k2", "r2")]);
        let faults = FaultProfile {
            tampering_probability: 0.0,
            lazy_probability: 1.0,
        };
        assert!(hash_join(&l, 0, &r, 0, faults, &mut get_fixed_rng()).is_empty());
    }

    #[test]
    fn test_tampering_changes_one_field() {
        let l = pairs(&[("k1", "l1")]);
        let r = pairs(&[("k1", "r1")]);
        let faults = FaultProfile {
            tampering_probability: 1.0,
            lazy_probability: 0.0,
        };
        let res = hash_join(&l, 0, &r, 0, faults, &mut get_fixed_rng());
        assert_eq!(res.len(), 1);
        let (k, a, b) = &res[0];
        let changed = [k != "k1", a != "l1", b != "r1"];
        assert_eq!(changed.iter().filter(|c| **c).count(), 1);
        assert!(k.starts_with("k1") && a.starts_with("l1") && b.starts_with("r1"));
    }

    #[test]
    fn test_trusted_worker_ignores_faults() {
        let faults = FaultProfile {
            tampering_probability: 1.0,
            lazy_probability: 1.0,
        };
        let mut w = Worker::new(0, "w0".to_string(), true, faults, get_fixed_rng());
        let l = pairs(&[("k1", "l1")]);
        let r = pairs(&[("k1", "r1")]);
        assert_eq!(w.run(&l, 0, &r, 0).len(), 1);
    }

    #[test]
    #[should_panic(expected = "fault probabilities out of range")]
    fn test_invalid_probability_panics() {
        let faults = FaultProfile {
            tampering_probability: 2.0,
            lazy_probability: 0.0,
        };
        hash_join(&[], 0, &[], 0, faults, &mut get_fixed_rng());
    }
}
