use tracing::{debug, info};

use super::ControlError;
use crate::{
    crypto::CryptoBox, engine::assign_worker, message::MarkerPolicy, FIELD_SEP, MARKER_ID_SUFFIX,
    MARKER_PREFIX,
};

// candidates tried per requested marker before giving up
const ATTEMPTS_PER_MARKER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Marker {
    pub n: u64,
}

impl Marker {
    pub fn new(n: u64) -> Self {
        Self { n }
    }

    /// `-<n>_m`
    pub fn id(&self) -> String {
        format!("-{}{}", self.n, MARKER_ID_SUFFIX)
    }

    /// `marker_<n>`
    pub fn value(&self) -> String {
        format!("{}{}", MARKER_PREFIX, self.n)
    }

    pub fn payload(&self) -> String {
        format!("{}{}{}", self.id(), FIELD_SEP, self.value())
    }

    /// Exact match of a decrypted output row against this marker.
    pub fn matches(&self, key: &str, left: &str, right: &str) -> bool {
        let payload = self.payload();
        key == self.value() && left == payload && right == payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarkerSet {
    pub markers: Vec<Marker>,
    pub per_worker: Vec<usize>,
}

/// Places exactly `n` markers so every worker gets between `n_min` and
/// `n_max`. Candidates are numbered from 0, so the same keys and workers
/// always yield the same set; the client relies on this to know what to
/// expect back.
pub struct MarkerGenerator<'a> {
    crypto: &'a CryptoBox,
    num_workers: usize,
}

impl<'a> MarkerGenerator<'a> {
    pub fn new(crypto: &'a CryptoBox, num_workers: usize) -> Self {
        Self {
            crypto,
            num_workers,
        }
    }

    pub fn generate(&self, policy: MarkerPolicy) -> Result<MarkerSet, ControlError> {
        let MarkerPolicy { n, n_min, n_max } = policy;
        if n_min < 0 || n_max < n_min || n < n_min {
            return Err(ControlError::InvalidMarkerBounds { n, n_min, n_max });
        }
        if self.num_workers == 0 {
            return Err(ControlError::NoWorkers);
        }
        if (self.num_workers as i64) * n_max < n {
            return Err(ControlError::UnreachableMarkerCount {
                n,
                workers: self.num_workers,
                n_max,
            });
        }

        let target = n as usize;
        let n_min = n_min as usize;
        let n_max = n_max as usize;
        let mut per_worker = vec![0usize; self.num_workers];
        let mut spare = n - (n_min * self.num_workers) as i64;
        let mut markers = Vec::with_capacity(target);
        let max_attempts = (target + 1) * ATTEMPTS_PER_MARKER * self.num_workers;
        let mut counter = 0u64;

        while markers.len() < target {
            if counter as usize >= max_attempts {
                return Err(ControlError::MarkerSearchExhausted {
                    attempts: counter as usize,
                    accepted: markers.len(),
                });
            }
            let marker = Marker::new(counter);
            counter += 1;
            let w = assign_worker(&self.crypto.encrypt(&marker.value()), self.num_workers);
            let cnt = per_worker[w];
            if cnt < n_min || (cnt < n_max && spare > 0) {
                per_worker[w] += 1;
                if per_worker[w] > n_min {
                    spare -= 1;
                }
                debug!(marker = %marker.value(), worker = w, "marker accepted");
                markers.push(marker);
            }
        }

        info!(
            markers = markers.len(),
            candidates = counter,
            per_worker = ?per_worker,
            "markers generated"
        );
        Ok(MarkerSet {
            markers,
            per_worker,
        })
    }
}
