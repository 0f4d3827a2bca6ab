use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

fn default_num_workers() -> usize {
    3
}

fn default_poll_interval_secs() -> f64 {
    1.0
}

fn default_stale_timeout_secs() -> u64 {
    300
}

fn default_stale_check_interval_secs() -> u64 {
    60
}

fn default_office_concurrency() -> usize {
    2
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_cleanup_days() -> u32 {
    7
}

fn default_converter_timeout_secs() -> u64 {
    300
}

/// Queue engine configuration. Every knob is an explicit typed field — a
/// misspelled option simply does not exist, instead of vanishing into a
/// dynamic dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, Args)]
#[serde(default)]
pub struct QueueOpts {
    /// Number of concurrent workers.
    #[arg(long, require_equals = true, default_value = "3")]
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Idle poll delay in seconds.
    #[arg(long, require_equals = true, default_value = "1.0")]
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Age of a claim after which the task is deemed hung.
    #[arg(long, require_equals = true, default_value = "300")]
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,

    /// Reaper period in seconds.
    #[arg(long, require_equals = true, default_value = "60")]
    #[serde(default = "default_stale_check_interval_secs")]
    pub stale_check_interval_secs: u64,

    /// Concurrent office-suite subprocess cap.
    #[arg(long, require_equals = true, default_value = "2")]
    #[serde(default = "default_office_concurrency")]
    pub office_concurrency: usize,

    /// Enqueue size ceiling in bytes.
    #[arg(long, require_equals = true, default_value = "52428800")]
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Retention cutoff for the cleanup sweep.
    #[arg(long, require_equals = true, default_value = "7")]
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: u32,

    /// Per-conversion wall-clock limit in seconds.
    #[arg(long, require_equals = true, default_value = "300")]
    #[serde(default = "default_converter_timeout_secs")]
    pub converter_timeout_secs: u64,
}

impl Default for QueueOpts {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            poll_interval_secs: default_poll_interval_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
            stale_check_interval_secs: default_stale_check_interval_secs(),
            office_concurrency: default_office_concurrency(),
            max_file_size: default_max_file_size(),
            cleanup_days: default_cleanup_days(),
            converter_timeout_secs: default_converter_timeout_secs(),
        }
    }
}

impl QueueOpts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs)
    }

    pub fn converter_timeout(&self) -> Duration {
        Duration::from_secs(self.converter_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = QueueOpts::default();
        assert_eq!(opts.num_workers, 3);
        assert_eq!(opts.poll_interval(), Duration::from_secs(1));
        assert_eq!(opts.stale_timeout_secs, 300);
        assert_eq!(opts.stale_check_interval_secs, 60);
        assert_eq!(opts.office_concurrency, 2);
        assert_eq!(opts.max_file_size, 50 * 1024 * 1024);
        assert_eq!(opts.cleanup_days, 7);
        assert_eq!(opts.converter_timeout_secs, 300);
    }

    #[test]
    fn partial_config_files_fall_back_to_defaults() {
        let opts: QueueOpts = serde_json::from_str(r#"{"num_workers": 8}"#).unwrap();
        assert_eq!(opts.num_workers, 8);
        assert_eq!(opts.office_concurrency, 2);
        assert_eq!(opts.converter_timeout_secs, 300);
    }
}
