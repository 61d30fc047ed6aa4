use std::{fs, path::Path};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    message::{MarkerPolicy, TwinCondition},
    relation::QueryFilter,
    MAX_FRAGMENT_SIZE, SALT_WAIT_TIMEOUT_MS,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub number_of_runs: usize,
    pub tampering_probability: f64,
    pub lazy_probability: f64,
    pub trusted_worker_fraction: f64,
    pub max_fragment_size: usize,
    pub salt_timeout_ms: u64,
    // seeds the fault injection and key generation; entropy when absent
    pub seed: Option<u64>,
    pub log_directives: String,
    // JSON list of per-run records; nothing is written when absent
    pub statistics_path: Option<String>,
    pub overwrite_statistics: bool,
    pub client: ClientConfig,
    pub data: DataConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            number_of_runs: 3,
            tampering_probability: 0.0,
            lazy_probability: 0.0,
            trusted_worker_fraction: 1.0,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            salt_timeout_ms: SALT_WAIT_TIMEOUT_MS,
            seed: None,
            log_directives: "info".to_string(),
            statistics_path: None,
            overwrite_statistics: false,
            client: ClientConfig::default(),
            data: DataConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub workers: Vec<String>,
    pub markers: MarkerPolicy,
    pub replication_factor: usize,
    pub twin_condition: TwinCondition,
    pub use_occurrences: bool,
    pub is_semi_join: bool,
    pub min_salt_length: usize,
    pub filter_l: QueryFilter,
    pub filter_r: QueryFilter,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            workers: (0..4).map(|i| format!("worker-{}", i)).collect(),
            markers: MarkerPolicy {
                n: 8,
                n_min: 1,
                n_max: 4,
            },
            replication_factor: 2,
            twin_condition: TwinCondition::Sample { p_twin: 0.25 },
            use_occurrences: false,
            is_semi_join: false,
            min_salt_length: 3,
            filter_l: QueryFilter::All,
            filter_r: QueryFilter::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub join_values: Vec<String>,
    pub l: HolderDataConfig,
    pub r: HolderDataConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        let join_values = ["Jerrie", "Ilsa", "Merry", "Dorian", "Ulla", "Kaspar", "Odette", "Brann"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            join_values,
            l: HolderDataConfig {
                size: 40,
                join_proportions: vec![],
                seed: 1,
            },
            r: HolderDataConfig {
                size: 60,
                join_proportions: vec![0.5, 0.25, 0.25],
                seed: 2,
            },
        }
    }
}

/// Synthetic relation of `size` tuples. With proportions, bucket `i` gets
/// `round(p_i * size)` tuples of join value `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HolderDataConfig {
    pub size: usize,
    pub join_proportions: Vec<f64>,
    pub seed: u64,
}

impl SimulationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: SimulationConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, p) in [
            ("tampering_probability", self.tampering_probability),
            ("lazy_probability", self.lazy_probability),
            ("trusted_worker_fraction", self.trusted_worker_fraction),
        ] {
            ensure!((0.0..=1.0).contains(&p), "{} must lie in [0, 1], got {}", name, p);
        }
        ensure!(self.max_fragment_size > 0, "max_fragment_size must be positive");
        ensure!(!self.client.workers.is_empty(), "at least one worker is required");
        ensure!(self.client.replication_factor >= 1, "replication_factor must be >= 1");
        if let TwinCondition::Sample { p_twin } = self.client.twin_condition {
            ensure!(p_twin > 0.0 && p_twin <= 1.0, "p_twin must lie in (0, 1], got {}", p_twin);
        }
        for holder in [&self.data.l, &self.data.r] {
            let total: f64 = holder.join_proportions.iter().sum();
            ensure!(
                holder.join_proportions.iter().all(|p| *p >= 0.0) && total <= 1.0 + 1e-9,
                "join proportions must be non-negative and sum to at most 1"
            );
            ensure!(
                holder.join_proportions.len() <= self.data.join_values.len(),
                "more join proportions than join values"
            );
        }
        ensure!(!self.data.join_values.is_empty(), "join value pool is empty");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        SimulationConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let raw = r#"{
            "number_of_runs": 5,
            "lazy_probability": 0.1,
            "client": { "workers": ["a", "b"], "use_occurrences": true }
        }"#;
        let config: SimulationConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.number_of_runs, 5);
        assert_eq!(config.max_fragment_size, MAX_FRAGMENT_SIZE);
        assert_eq!(config.client.workers.len(), 2);
        assert!(config.client.use_occurrences);
        assert_eq!(config.client.replication_factor, 2);
        assert_eq!(config.statistics_path, None);
        assert!(!config.overwrite_statistics);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = SimulationConfig::default();
        config.tampering_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.client.workers.clear();
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.data.r.join_proportions = vec![0.7, 0.7];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("verijoin_config_test.json");
        let config = SimulationConfig::default();
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = SimulationConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        fs::remove_file(&path).unwrap();
        assert!(SimulationConfig::load(&path).is_err());
    }
}
