// Configuration management with layered configuration (file, env)

use crate::models::JobOptions;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub defaults: JobDefaultsConfig,
    #[serde(default)]
    pub workers: Vec<WorkerTypeConfig>,
    /// Absent means the in-memory store
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Absent means the in-process change feed and notifier
    #[serde(default)]
    pub nats: Option<NatsConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How far in the past an `at` trigger may be and still fire
    pub stale_window_seconds: u64,
    /// IANA timezone used to evaluate cron rules
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stale_window_seconds: 24 * 60 * 60,
            timezone: "UTC".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Jobs allowed to wait per worker type; 0 means unbounded
    pub max_backlog: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30 * 60 * 1_000,
            jitter_factor: 0.1,
        }
    }
}

/// Limits applied to jobs that leave them unset; 0 seconds disables a limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaultsConfig {
    pub max_exec_count: u32,
    pub max_exec_time_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for JobDefaultsConfig {
    fn default() -> Self {
        Self {
            max_exec_count: 3,
            max_exec_time_seconds: 0,
            timeout_seconds: 60,
        }
    }
}

impl JobDefaultsConfig {
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            max_exec_count: self.max_exec_count,
            max_exec_time: Some(Duration::from_secs(self.max_exec_time_seconds)),
            timeout: Some(Duration::from_secs(self.timeout_seconds)),
        }
    }
}

/// One worker type served by the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTypeConfig {
    pub worker_type: String,
    pub concurrency: usize,
    #[serde(default)]
    pub max_exec_count: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_exec_time_seconds: Option<u64>,
}

impl WorkerTypeConfig {
    /// Worker-level defaults layered over the global ones
    pub fn job_defaults(&self, global: &JobDefaultsConfig) -> JobOptions {
        let base = global.job_options();
        JobOptions {
            max_exec_count: self.max_exec_count.unwrap_or(base.max_exec_count),
            max_exec_time: self
                .max_exec_time_seconds
                .map(Duration::from_secs)
                .or(base.max_exec_time),
            timeout: self.timeout_seconds.map(Duration::from_secs).or(base.timeout),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    /// Subject carrying JSON change events
    #[serde(default = "default_changes_subject")]
    pub changes_subject: String,
    /// Prefix of the subjects job state events are published on
    #[serde(default = "default_events_prefix")]
    pub events_subject_prefix: String,
}

fn default_changes_subject() -> String {
    "changes".to_string()
}

fn default_events_prefix() -> String {
    "jobs.events".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("JOBS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!("Unknown timezone: {}", self.scheduler.timezone));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err("Retry jitter_factor must be between 0 and 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("Retry base_delay_ms cannot exceed max_delay_ms".to_string());
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.worker_type.trim().is_empty() {
                return Err("Worker type cannot be empty".to_string());
            }
            if worker.concurrency == 0 {
                return Err(format!(
                    "Worker '{}' concurrency must be greater than 0",
                    worker.worker_type
                ));
            }
            if !seen.insert(worker.worker_type.as_str()) {
                return Err(format!("Duplicate worker type: {}", worker.worker_type));
            }
        }

        if let Some(database) = &self.database {
            if database.url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if database.max_connections == 0 {
                return Err("Database max_connections must be greater than 0".to_string());
            }
        }

        if let Some(nats) = &self.nats {
            if nats.url.is_empty() {
                return Err("NATS URL cannot be empty".to_string());
            }
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            broker: BrokerConfig::default(),
            retry: RetryConfig::default(),
            defaults: JobDefaultsConfig::default(),
            workers: vec![WorkerTypeConfig {
                worker_type: "log".to_string(),
                concurrency: 2,
                max_exec_count: None,
                timeout_seconds: None,
                max_exec_time_seconds: None,
            }],
            database: None,
            nats: None,
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, concurrency: usize) -> WorkerTypeConfig {
        WorkerTypeConfig {
            worker_type: name.to_string(),
            concurrency,
            max_exec_count: None,
            timeout_seconds: None,
            max_exec_time_seconds: None,
        }
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_validation_catches_zero_concurrency() {
        let mut settings = Settings::default();
        settings.workers.push(worker("mail", 0));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_duplicate_worker_types() {
        let mut settings = Settings::default();
        settings.workers.push(worker("log", 1));
        assert!(settings.validate().unwrap_err().contains("Duplicate"));
    }

    #[test]
    fn test_validation_catches_empty_worker_type() {
        let mut settings = Settings::default();
        settings.workers.push(worker("  ", 1));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.scheduler.timezone = "Mars/Olympus_Mons".to_string();
        assert!(settings.validate().is_err());

        settings.scheduler.timezone = "Asia/Ho_Chi_Minh".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_jitter_out_of_range() {
        let mut settings = Settings::default();
        settings.retry.jitter_factor = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_worker_defaults_override_global_ones() {
        let global = JobDefaultsConfig::default();
        let mut mail = worker("mail", 1);
        mail.max_exec_count = Some(5);
        mail.timeout_seconds = Some(0);

        let options = mail.job_defaults(&global);
        assert_eq!(options.max_exec_count, 5);
        // 0 seconds disables the per-attempt limit
        assert_eq!(options.timeout, Some(Duration::ZERO));
        assert_eq!(options.attempt_timeout(), None);
        assert_eq!(options.overall_limit(), None);
    }

    #[test]
    fn test_load_from_missing_directory_uses_defaults() {
        let settings = Settings::load_from_path("does-not-exist").unwrap();
        assert_eq!(settings.scheduler.stale_window_seconds, 86_400);
        assert!(settings.database.is_none());
    }
}
