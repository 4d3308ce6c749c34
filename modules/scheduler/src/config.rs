use process_runner::{OverflowPolicy, RunnerOptions, DEFAULT_ENV_ALLOWLIST};
use serde::{Deserialize, Serialize};
use session_store::StoreConfig;
use std::path::PathBuf;
use std::time::Duration;

/// The `engine:` section of scantool.yaml.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub global_max_concurrent: usize,
    pub per_owner_max_concurrent: usize,
    pub max_queued: usize,
    pub store_capacity: usize,
    pub retention_secs: u64,
    /// Per owner; 0 disables the limit.
    pub submissions_per_minute: u32,
    pub max_timeout_secs: u64,
    pub grace_ms: u64,
    pub env_allowlist: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub overflow: OverflowPolicy,
    pub spawn_retries: u32,
    pub retry_delay_ms: u64,
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            global_max_concurrent: 4,
            per_owner_max_concurrent: 2,
            max_queued: 256,
            store_capacity: 1024,
            retention_secs: 3600,
            submissions_per_minute: 60,
            max_timeout_secs: 900,
            grace_ms: 2000,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            overflow: OverflowPolicy::Drain,
            spawn_retries: 2,
            retry_delay_ms: 100,
            sweep_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.global_max_concurrent == 0 || self.per_owner_max_concurrent == 0 {
            return Err("concurrency limits must be at least 1".into());
        }
        if self.max_timeout_secs == 0 {
            return Err("max_timeout_secs must be positive".into());
        }
        if self.store_capacity == 0 {
            return Err("store_capacity must be positive".into());
        }
        Ok(())
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            working_dir: self.working_dir.clone(),
            env_allowlist: self.env_allowlist.clone(),
            grace: Duration::from_millis(self.grace_ms),
            overflow: self.overflow,
            spawn_retries: self.spawn_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig { capacity: self.store_capacity, retention: Duration::from_secs(self.retention_secs) }
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_section_keeps_defaults() {
        let cfg: EngineConfig = serde_yaml::from_str("global_max_concurrent: 8\noverflow: kill\n").unwrap();
        assert_eq!(cfg.global_max_concurrent, 8);
        assert_eq!(cfg.per_owner_max_concurrent, 2);
        assert_eq!(cfg.overflow, OverflowPolicy::Kill);
        assert_eq!(cfg.runner_options().grace, Duration::from_secs(2));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_typos_and_zero_limits() {
        assert!(serde_yaml::from_str::<EngineConfig>("global_max_concurent: 8\n").is_err());
        let cfg = EngineConfig { per_owner_max_concurrent: 0, ..EngineConfig::default() };
        assert!(cfg.validate().is_err());
    }
}
