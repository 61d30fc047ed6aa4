use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::{
    control::{Entry, RealEntry},
    crypto::CryptoBox,
    engine::assign_worker,
    utils::ceil_div,
    BUCKET_SALT_SEP,
};

/// Spreads high-frequency join values over the worker pool.
///
/// Both holders derive the same salt sequence for a logical value: entry 0
/// is the value itself, later entries are `value%%k` with `k` advanced until
/// the salted key lands on a worker not yet used by the sequence (the used
/// set is reset once every worker has been taken).
pub struct SaltBucketizer<'a> {
    crypto: &'a CryptoBox,
    num_workers: usize,
    sequences: HashMap<String, Vec<String>>,
}

impl<'a> SaltBucketizer<'a> {
    pub fn new(crypto: &'a CryptoBox, num_workers: usize) -> Self {
        Self {
            crypto,
            num_workers: num_workers.max(1),
            sequences: HashMap::new(),
        }
    }

    fn worker_of(&self, key: &str) -> usize {
        assign_worker(&self.crypto.encrypt(key), self.num_workers)
    }

    pub fn effective_salts(&self, s: usize) -> usize {
        s.clamp(1, self.num_workers)
    }

    /// `b = 1` when every occurrence can get its own worker, `ceil(nmax / s)` otherwise.
    pub fn bucket_size(&self, nmax: usize, s: usize) -> usize {
        if nmax <= self.num_workers {
            1
        } else {
            ceil_div(nmax, self.effective_salts(s))
        }
    }

    pub fn salt_sequence(&mut self, value: &str, s: usize) -> Vec<String> {
        if let Some(seq) = self.sequences.get(value) {
            if seq.len() >= s {
                return seq[..s].to_vec();
            }
        }
        let mut seq = vec![value.to_string()];
        let mut used = HashSet::new();
        used.insert(self.worker_of(value));
        let mut k = 1usize;
        while seq.len() < s {
            if used.len() >= self.num_workers {
                used.clear();
            }
            let mut candidate = format!("{}{}{}", value, BUCKET_SALT_SEP, k);
            let mut w = self.worker_of(&candidate);
            k += 1;
            let mut attempts = 1;
            while used.contains(&w) && attempts < self.num_workers {
                candidate = format!("{}{}{}", value, BUCKET_SALT_SEP, k);
                w = self.worker_of(&candidate);
                k += 1;
                attempts += 1;
            }
            used.insert(w);
            seq.push(candidate);
        }
        self.sequences.insert(value.to_string(), seq.clone());
        seq
    }

    /// Salts the real entries of one side; markers and dummies pass through.
    /// `nmax == 1` replicates every tuple `s` times, otherwise each value's
    /// tuples are cut into chunks of `b`, chunk `j` keyed with salt `j mod s`
    /// and the last chunk padded with dummies.
    pub fn apply(&mut self, entries: Vec<Entry>, s: usize, nmax: usize) -> Vec<Entry> {
        let s = self.effective_salts(s);
        let mut order: Vec<String> = vec![];
        let mut buckets: HashMap<String, Vec<RealEntry>> = HashMap::new();
        let mut passthrough = vec![];
        for e in entries {
            match e {
                Entry::Real(r) => {
                    if !buckets.contains_key(&r.join_value) {
                        order.push(r.join_value.clone());
                    }
                    buckets.entry(r.join_value.clone()).or_default().push(r);
                }
                other => passthrough.push(other),
            }
        }

        let mut out = SaltedOutput::default();
        let mut dummies = 0;
        if nmax <= 1 {
            for value in &order {
                let seq = self.salt_sequence(value, s);
                for r in &buckets[value] {
                    for key in &seq {
                        out.push(key, Entry::Real(r.with_key(key.clone())));
                    }
                }
            }
        } else {
            let b = self.bucket_size(nmax, s);
            for value in &order {
                let bucket = &buckets[value];
                let chunks = ceil_div(bucket.len(), b);
                let seq = self.salt_sequence(value, s.min(chunks));
                for (j, chunk) in bucket.chunks(b).enumerate() {
                    let key = &seq[j % seq.len()];
                    for r in chunk {
                        out.push(key, Entry::Real(r.with_key(key.clone())));
                    }
                    for _ in chunk.len()..b {
                        out.push(
                            key,
                            Entry::Dummy {
                                key: key.clone(),
                                join_value: value.clone(),
                            },
                        );
                        dummies += 1;
                    }
                }
                debug!(value = %value, size = bucket.len(), chunks, "bucket salted");
            }
            info!(bucket_size = b, dummies, "buckets padded");
        }
        info!(salts = s, nmax, values = order.len(), "salting applied");

        let mut res = out.into_entries();
        res.extend(passthrough);
        res
    }
}

// rows kept together by salted key, keys in first-seen order
#[derive(Default)]
struct SaltedOutput {
    order: Vec<String>,
    groups: HashMap<String, Vec<Entry>>,
}

impl SaltedOutput {
    fn push(&mut self, key: &str, e: Entry) {
        if !self.groups.contains_key(key) {
            self.order.push(key.to_string());
        }
        self.groups.entry(key.to_string()).or_default().push(e);
    }

    fn into_entries(mut self) -> Vec<Entry> {
        let mut res = vec![];
        for key in &self.order {
            if let Some(group) = self.groups.remove(key) {
                res.extend(group);
            }
        }
        res
    }
}
