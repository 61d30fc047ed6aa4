use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use anyhow::{Error, Result};
use rand::{rngs::StdRng, SeedableRng};
use tracing_subscriber::filter::EnvFilter;

use crate::SEED;

pub fn init_tracing_subscriber(directives: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(Error::msg)
}

pub fn get_fixed_rng() -> StdRng {
    let seed = SEED;
    let rng: StdRng = SeedableRng::seed_from_u64(seed);
    rng
}

/// Seeded rng when a seed is configured, entropy otherwise.
pub fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub fn string_to_hash_u32(s: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    (hasher.finish() & 0xFFFFFFFF) as u32
}

pub fn split_by_chunk_size<T>(vec: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
    let mut vec_iter = vec.into_iter().peekable();
    let mut chunks = vec![];
    while vec_iter.peek().is_some() {
        let chunk: Vec<T> = vec_iter.by_ref().take(chunk_size).collect();
        chunks.push(chunk);
    }
    chunks
}

/// Part of `s` before the first `sep`, or all of `s`.
pub fn prefix_of(s: &str, sep: char) -> &str {
    match s.find(sep) {
        Some(idx) => &s[..idx],
        None => s,
    }
}

/// Part of `s` after the last `sep`, or all of `s`.
pub fn suffix_of(s: &str, sep: char) -> &str {
    match s.rfind(sep) {
        Some(idx) => &s[idx + 1..],
        None => s,
    }
}

pub fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_by_chunk_size() {
        let chunks = split_by_chunk_size((0..7).collect::<Vec<u32>>(), 3);
        assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        let chunks = split_by_chunk_size(Vec::<u32>::new(), 3);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_prefix_suffix() {
        assert_eq!(prefix_of("1-L|Jerrie|69", '|'), "1-L");
        assert_eq!(suffix_of("1-L|Jerrie|69|3", '|'), "3");
        assert_eq!(prefix_of("marker_3", '|'), "marker_3");
        assert_eq!(suffix_of("marker_3", '|'), "marker_3");
    }

    #[test]
    fn test_hash_is_stable_within_process() {
        let a = string_to_hash_u32("0a1b2c");
        let b = string_to_hash_u32("0a1b2c");
        assert_eq!(a, b);
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(5, 2), 3);
        assert_eq!(ceil_div(4, 2), 2);
        assert_eq!(ceil_div(1, 3), 1);
    }
}
