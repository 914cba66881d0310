//! Shared utilities for CLI commands

use crate::notify::{LogNotifier, Notifier, OutboxNotifier};
use crate::retry::RetryPolicy;
use crate::scheduler::{LockSettings, SchedulerSettings};
use crate::system_config::{self, SystemConfig};
use anyhow::{Context, Result};
use digests::Backend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Load the config file and apply the `--data-dir` override
pub fn load_config(config: Option<&Path>, data_dir: Option<&Path>) -> Result<SystemConfig> {
    let mut config = system_config::load(config)?;
    if let Some(dir) = data_dir {
        config.store.path = Some(dir.to_path_buf());
    }
    Ok(config)
}

/// Sled database directory under the data directory
pub fn store_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("store")
}

/// Open the durable backend described by `config`
pub fn open_backend(config: &SystemConfig) -> Result<Backend> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let options = config.backend_options()?;
    let backend = Backend::open(&store_dir(&data_dir), options)
        .with_context(|| format!("Failed to open store in {}", data_dir.display()))?;
    Ok(backend.with_projects(Arc::new(config.project_table())))
}

/// Where delivered notifications are appended
pub fn outbox_path(config: &SystemConfig) -> PathBuf {
    config
        .scheduler
        .outbox
        .clone()
        .unwrap_or_else(|| config.data_dir().join("outbox.jsonl"))
}

/// Notification sink: the outbox, or the log with `log_only`
pub fn notifier(config: &SystemConfig, log_only: bool) -> Box<dyn Notifier> {
    if log_only {
        Box::new(LogNotifier)
    } else {
        Box::new(OutboxNotifier::new(outbox_path(config)))
    }
}

pub fn scheduler_settings(config: &SystemConfig) -> SchedulerSettings {
    let s = &config.scheduler;
    SchedulerSettings {
        ready_timeout: Duration::from_secs(s.ready_timeout_secs),
        retry: RetryPolicy::new(s.retry_attempts, s.retry_base_ms, s.retry_max_ms),
        lock: Some(LockSettings {
            dir: config.data_dir(),
            lease: s.lock_lease(),
            retries: s.lock_retries,
            wait: s.lock_wait(),
        }),
    }
}

/// Parse a `key=value` tag
pub fn parse_tag(tag: &str) -> Result<(String, String)> {
    match tag.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("Invalid tag '{}': expected key=value", tag),
    }
}

/// Format a unix timestamp relative to `now` ("in 5 minutes", "2 hours ago")
pub fn format_relative_time(ts: f64, now: f64) -> String {
    let delta = ts - now;
    let seconds = delta.abs() as u64;

    let amount = if seconds < 60 {
        format!("{} seconds", seconds)
    } else if seconds < 3600 {
        format!("{} minutes", seconds / 60)
    } else if seconds < 86400 {
        format!("{} hours", seconds / 3600)
    } else {
        format!("{} days", seconds / 86400)
    };

    if seconds == 0 {
        "now".to_string()
    } else if delta > 0.0 {
        format!("in {}", amount)
    } else {
        format!("{} ago", amount)
    }
}
