use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::session::RunReport;

/// One line of the statistics file, flattened from a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: usize,
    pub elapsed_ms: u64,
    pub table_l_size: usize,
    pub table_r_size: usize,
    pub result_rows: usize,
    pub twins_l: usize,
    pub twins_r: usize,
    pub markers: usize,
    pub nmax_l: usize,
    pub nmax_r: usize,
    pub occurrence_controls_l: usize,
    pub occurrence_controls_r: usize,
    pub control_tuples: usize,
    pub control_tuples_size: usize,
    pub tampering_error: bool,
    pub integrity_error: bool,
    pub creation_overhead_l_ms: u64,
    pub creation_overhead_r_ms: u64,
    pub check_integrity_ms: u64,
}

impl From<&RunReport> for RunRecord {
    fn from(r: &RunReport) -> Self {
        Self {
            run_id: r.run + 1,
            elapsed_ms: r.elapsed_ms,
            table_l_size: r.holder_l.table_size,
            table_r_size: r.holder_r.table_size,
            result_rows: r.stats.result_rows,
            twins_l: r.holder_l.twins,
            twins_r: r.holder_r.twins,
            markers: r.holder_l.markers,
            nmax_l: r.holder_l.nmax,
            nmax_r: r.holder_r.nmax,
            occurrence_controls_l: r.holder_l.occurrence_controls,
            occurrence_controls_r: r.holder_r.occurrence_controls,
            control_tuples: r.stats.control_tuples,
            control_tuples_size: r.stats.control_tuples_size,
            tampering_error: r.stats.tampering,
            integrity_error: r.stats.integrity_error,
            creation_overhead_l_ms: r.holder_l.creation_ms,
            creation_overhead_r_ms: r.holder_r.creation_ms,
            check_integrity_ms: r.stats.check_integrity_ms,
        }
    }
}

/// Writes `records` as a JSON list. Unless `overwrite` is set, records
/// already in the file are kept in front of the new ones.
pub fn write_statistics(path: impl AsRef<Path>, records: &[RunRecord], overwrite: bool) -> Result<()> {
    let path = path.as_ref();
    let mut all: Vec<RunRecord> = vec![];
    if !overwrite && path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read statistics {}", path.display()))?;
        all = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse statistics {}", path.display()))?;
    }
    let kept = all.len();
    all.extend_from_slice(records);

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(&all)?;
    fs::write(path, json).with_context(|| format!("failed to write statistics {}", path.display()))?;
    info!(path = %path.display(), kept, added = records.len(), "statistics written");
    Ok(())
}
