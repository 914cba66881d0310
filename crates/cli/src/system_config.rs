//! System configuration file
//!
//! Loaded from `--config`, `DIGESTD_CONFIG`, or
//! `<config dir>/digestd/config.toml`. A missing file means defaults.

use anyhow::{Context, Result};
use digest_core::{Backoff, BackendOptions, Codec, Delays};
use digests::{ProjectSettings, StaticProjects};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub store: StoreConfig,
    pub backend: BackendConfig,
    pub scheduler: SchedulerConfig,
    /// Per-project switches and overrides, keyed by project id
    pub projects: BTreeMap<String, ProjectSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory (default: `<data dir>/digestd`)
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Prefix of project timeline ids (`<namespace>:p:<project>`)
    pub namespace: String,
    /// bincode | zstd | gzip
    pub codec: String,
    /// Compression level for zstd/gzip
    pub codec_level: Option<i32>,
    /// linear | constant
    pub backoff: String,
    pub minimum_delay: f64,
    pub maximum_delay: f64,
    pub increment_delay: f64,
    pub capacity: Option<usize>,
    pub truncation_chance: Option<f64>,
    /// Seconds after which undelivered records are dropped (default: never).
    /// Must exceed `scheduler.ready_timeout_secs + maximum_delay`.
    pub ttl: Option<f64>,
    pub batch_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let defaults = BackendOptions::default();
        Self {
            namespace: "digests".to_string(),
            codec: defaults.codec.name().to_string(),
            codec_level: None,
            backoff: defaults.backoff.name().to_string(),
            minimum_delay: defaults.delays.minimum_delay,
            maximum_delay: defaults.delays.maximum_delay,
            increment_delay: defaults.delays.increment_delay,
            capacity: defaults.capacity,
            truncation_chance: defaults.truncation_chance,
            ttl: defaults.ttl,
            batch_size: defaults.batch_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between ticks
    pub interval_secs: u64,
    /// Seconds a timeline may sit in ready before maintenance requeues it
    pub ready_timeout_secs: u64,
    /// How long one tick may keep the tick lock
    pub lock_lease_secs: u64,
    /// Extra attempts at taking a busy tick lock
    pub lock_retries: u32,
    /// Wait between tick lock attempts
    pub lock_wait_ms: u64,
    /// Attempts per timeline on retriable storage errors
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Append delivered notifications to this file as JSON lines
    pub outbox: Option<PathBuf>,
    /// Write daily-rotated log files here
    pub log_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            ready_timeout_secs: 3600,
            lock_lease_secs: 60,
            lock_retries: 3,
            lock_wait_ms: 500,
            retry_attempts: 3,
            retry_base_ms: 250,
            retry_max_ms: 5_000,
            outbox: None,
            log_dir: None,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

impl SystemConfig {
    /// Check value ranges and that backend options are usable
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if !(1..=86_400).contains(&s.interval_secs) {
            anyhow::bail!("scheduler.interval_secs must be 1-86400, got {}", s.interval_secs);
        }
        if !(1..=604_800).contains(&s.ready_timeout_secs) {
            anyhow::bail!(
                "scheduler.ready_timeout_secs must be 1-604800, got {}",
                s.ready_timeout_secs
            );
        }
        if !(1..=3_600).contains(&s.lock_lease_secs) {
            anyhow::bail!("scheduler.lock_lease_secs must be 1-3600, got {}", s.lock_lease_secs);
        }
        if !(1..=10).contains(&s.retry_attempts) {
            anyhow::bail!("scheduler.retry_attempts must be 1-10, got {}", s.retry_attempts);
        }
        if s.retry_base_ms > s.retry_max_ms {
            anyhow::bail!(
                "scheduler.retry_base_ms ({}) exceeds retry_max_ms ({})",
                s.retry_base_ms,
                s.retry_max_ms
            );
        }
        if self.backend.namespace.is_empty() || self.backend.namespace.contains(":p:") {
            anyhow::bail!("backend.namespace must be non-empty and must not contain ':p:'");
        }

        let options = self.backend_options().context("Invalid [backend] section")?;
        let ready_timeout = s.ready_timeout_secs as f64;
        options
            .validate_ttl(ready_timeout)
            .context("Invalid backend.ttl")?;

        for (project, settings) in &self.projects {
            let delays = self.backend.delays().with_overrides(&settings.overrides);
            delays
                .validate()
                .with_context(|| format!("Invalid overrides for project '{}'", project))?;
            BackendOptions {
                delays,
                ..options.clone()
            }
            .validate_ttl(ready_timeout)
            .with_context(|| format!("backend.ttl is too short for project '{}'", project))?;
            if settings.overrides.capacity == Some(0) {
                anyhow::bail!("projects.{}.capacity must be at least 1", project);
            }
        }

        Ok(())
    }

    /// Validated backend options
    pub fn backend_options(&self) -> Result<BackendOptions> {
        let b = &self.backend;
        let options = BackendOptions {
            codec: Codec::from_name(&b.codec, b.codec_level)?,
            backoff: b.backoff.parse::<Backoff>()?,
            delays: b.delays(),
            capacity: b.capacity,
            truncation_chance: b.truncation_chance,
            ttl: b.ttl,
            batch_size: b.batch_size,
        };
        Ok(options.validated()?)
    }

    pub fn project_table(&self) -> StaticProjects {
        self.projects
            .iter()
            .map(|(project, settings)| (project.clone(), *settings))
            .collect()
    }

    /// Data directory, falling back to the platform data dir
    pub fn data_dir(&self) -> PathBuf {
        if let Some(path) = &self.store.path {
            return path.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("digestd"))
            .unwrap_or_else(|| PathBuf::from(".digestd"))
    }
}

impl BackendConfig {
    pub fn delays(&self) -> Delays {
        Delays {
            minimum_delay: self.minimum_delay,
            maximum_delay: self.maximum_delay,
            increment_delay: self.increment_delay,
        }
    }
}

/// Resolve the config file location
pub fn config_file_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("digestd").join("config.toml"))
}

/// Load configuration, using defaults when the file does not exist
pub fn load(explicit: Option<&Path>) -> Result<SystemConfig> {
    let path = config_file_path(explicit)?;
    if !path.exists() {
        return Ok(SystemConfig::default());
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SystemConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok(config)
}

/// Write the example configuration if no file exists yet.
/// Returns true if a file was created.
pub fn init_if_missing(explicit: Option<&Path>) -> Result<bool> {
    let path = config_file_path(explicit)?;
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    std::fs::write(&path, example_config())
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(true)
}

/// Commented example configuration with every default spelled out
pub fn example_config() -> &'static str {
    r#"# digestd configuration

[store]
# Data directory (default: platform data dir + /digestd)
# path = "/var/lib/digestd"

[backend]
namespace = "digests"
# bincode | zstd | gzip
codec = "zstd"
# codec_level = 3
# linear | constant
backoff = "linear"
# Seconds
minimum_delay = 300.0
maximum_delay = 1800.0
increment_delay = 300.0
# Soft cap on records per timeline; truncation runs on ~1/capacity adds
# capacity = 1000
# truncation_chance = 0.001
# Drop records still undelivered after this many seconds (default: never).
# Must exceed scheduler.ready_timeout_secs + maximum_delay.
# ttl = 86400.0
batch_size = 1000

[scheduler]
interval_secs = 60
ready_timeout_secs = 3600
lock_lease_secs = 60
lock_retries = 3
lock_wait_ms = 500
retry_attempts = 3
retry_base_ms = 250
retry_max_ms = 5000
# outbox = "/var/lib/digestd/outbox.jsonl"
# log_dir = "/var/log/digestd"

# [projects.42]
# enabled = true
# minimum_delay = 60.0
# capacity = 200
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        let config = SystemConfig::default();
        config.validate().unwrap();
        assert_eq!(config.backend_options().unwrap(), BackendOptions::default());
    }

    #[test]
    fn test_example_parses_to_defaults() {
        let config: SystemConfig = toml::from_str(example_config()).unwrap();
        config.validate().unwrap();
        assert_eq!(config, SystemConfig::default());
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, SystemConfig::default());
    }

    #[test]
    fn test_partial_file_with_projects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[backend]
codec = "gzip"
capacity = 50

[scheduler]
interval_secs = 5

[projects.7]
enabled = false

[projects.8]
minimum_delay = 10
"#,
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.interval_secs, 5);
        assert_eq!(config.scheduler.retry_attempts, 3);

        let options = config.backend_options().unwrap();
        assert_eq!(options.codec, Codec::Gzip { level: 6 });
        assert_eq!(options.truncation_chance, Some(1.0 / 50.0));

        let projects = config.project_table();
        use digests::ProjectConfig;
        assert!(!projects.enabled("7"));
        assert!(projects.enabled("8"));
        assert_eq!(projects.overrides("8").minimum_delay, Some(10.0));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = SystemConfig::default();
        config.scheduler.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = SystemConfig::default();
        config.backend.codec = "lz4".into();
        assert!(config.validate().is_err());

        let mut config = SystemConfig::default();
        config.backend.minimum_delay = 4_000.0;
        assert!(config.validate().is_err());

        let mut config = SystemConfig::default();
        config.projects.insert(
            "1".into(),
            ProjectSettings {
                enabled: true,
                overrides: digest_core::Overrides {
                    maximum_delay: Some(1.0),
                    ..Default::default()
                },
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_must_cover_ready_timeout() {
        let mut config = SystemConfig::default();
        assert_eq!(config.backend.ttl, None);

        // ready_timeout 3600 + maximum_delay 1800
        config.backend.ttl = Some(5_400.0);
        assert!(config.validate().is_err());
        config.backend.ttl = Some(5_401.0);
        config.validate().unwrap();

        config.projects.insert(
            "1".into(),
            ProjectSettings {
                enabled: true,
                overrides: digest_core::Overrides {
                    maximum_delay: Some(3_600.0),
                    ..Default::default()
                },
            },
        );
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("project '1'"));
    }

    #[test]
    fn test_init_if_missing_writes_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        assert!(init_if_missing(Some(&path)).unwrap());
        assert!(!init_if_missing(Some(&path)).unwrap());
        assert!(load(Some(&path)).is_ok());
    }
}
