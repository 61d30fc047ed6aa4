use crate::{message::Pair, utils::string_to_hash_u32};

/// Worker owning an encrypted join key. Holders and the computation layer
/// must agree on it for partitions to line up.
pub fn assign_worker(encrypted_key: &str, num_workers: usize) -> usize {
    if num_workers <= 1 {
        return 0;
    }
    (string_to_hash_u32(encrypted_key) as usize) % num_workers
}

/// Join key of a pair given the sender's join attribute position.
pub(crate) fn join_key(pair: &Pair, join_attribute: usize) -> &str {
    if join_attribute == 0 {
        &pair.0
    } else {
        &pair.1
    }
}

pub(crate) fn other_value(pair: &Pair, join_attribute: usize) -> &str {
    if join_attribute == 0 {
        &pair.1
    } else {
        &pair.0
    }
}

/// Splits a relation into one partition per worker.
pub fn partition(relation: &[Pair], join_attribute: usize, num_workers: usize) -> Vec<Vec<Pair>> {
    let mut parts = vec![vec![]; num_workers.max(1)];
    for pair in relation {
        let w = assign_worker(join_key(pair, join_attribute), num_workers);
        parts[w].push(pair.clone());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_by_key() {
        let relation: Vec<Pair> = (0..50)
            .map(|i| (format!("k{}", i % 7), format!("v{}", i)))
            .collect();
        let parts = partition(&relation, 0, 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), 50);
        for (w, part) in parts.iter().enumerate() {
            for pair in part {
                assert_eq!(assign_worker(&pair.0, 3), w);
            }
        }
    }

    #[test]
    fn test_join_attribute_position() {
        let p: Pair = ("key".to_string(), "value".to_string());
        assert_eq!(join_key(&p, 0), "key");
        assert_eq!(other_value(&p, 0), "value");
        assert_eq!(join_key(&p, 1), "value");
        assert_eq!(other_value(&p, 1), "key");
        let swapped: Vec<Pair> = vec![("x".to_string(), "k".to_string())];
        let parts = partition(&swapped, 1, 4);
        assert_eq!(parts[assign_worker("k", 4)].len(), 1);
    }

    #[test]
    fn test_single_worker() {
        assert_eq!(assign_worker("anything", 1), 0);
        assert_eq!(assign_worker("anything", 0), 0);
    }
}
