//! Rendering digests and delivering notifications

use anyhow::{Context, Result};
use digest_core::{project_of, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use ulid::Ulid;

/// Record payload queued by `digestd add`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub message: String,
    pub level: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Event {
    pub fn new(message: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: level.into(),
            tags: BTreeMap::new(),
        }
    }
}

/// A rendered digest, ready to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Digest attempt id
    pub id: String,
    pub timeline: String,
    pub project: Option<String>,
    pub subject: String,
    pub lines: Vec<String>,
    /// Records delivered
    pub count: usize,
    /// Records dropped as undecodable or expired
    pub skipped: usize,
    pub generated_at: f64,
}

/// Turns digested records into a notification
pub trait Renderer: Send + Sync {
    fn render_digest(
        &self,
        id: Ulid,
        timeline: &str,
        records: &[Record<Event>],
        skipped: usize,
    ) -> Result<Notification>;
}

/// Delivers rendered notifications
pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<()>;
}

/// Plain-text summary: a subject line plus one line per event
#[derive(Debug, Clone)]
pub struct SummaryRenderer {
    /// Events listed before the rest are folded into "and N more"
    pub max_lines: usize,
}

impl Default for SummaryRenderer {
    fn default() -> Self {
        Self { max_lines: 10 }
    }
}

impl Renderer for SummaryRenderer {
    fn render_digest(
        &self,
        id: Ulid,
        timeline: &str,
        records: &[Record<Event>],
        skipped: usize,
    ) -> Result<Notification> {
        let project = project_of(timeline).map(str::to_string);
        let noun = if records.len() == 1 { "event" } else { "events" };
        let subject = match &project {
            Some(project) => format!("{} new {} in project {}", records.len(), noun, project),
            None => format!("{} new {} on {}", records.len(), noun, timeline),
        };

        let mut lines: Vec<String> = records
            .iter()
            .take(self.max_lines)
            .map(|r| format!("[{}] {} ({})", r.value.level, r.value.message, r.key))
            .collect();
        if records.len() > self.max_lines {
            lines.push(format!("... and {} more", records.len() - self.max_lines));
        }

        Ok(Notification {
            id: id.to_string(),
            timeline: timeline.to_string(),
            project,
            subject,
            lines,
            count: records.len(),
            skipped,
            generated_at: digest_core::now_secs(),
        })
    }
}

/// Appends each notification to a file as one JSON line
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    path: PathBuf,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every notification written so far
    pub fn read_all(path: &Path) -> Result<Vec<Notification>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read outbox {}", path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Corrupt outbox line"))
            .collect()
    }
}

impl Notifier for OutboxNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create outbox directory")?;
        }
        let mut line = serde_json::to_string(notification)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open outbox {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

/// Logs notifications instead of sending them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            timeline = %notification.timeline,
            digest = %notification.id,
            count = notification.count,
            "{}",
            notification.subject
        );
        for line in &notification.lines {
            info!(timeline = %notification.timeline, "  {}", line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn records(n: usize) -> Vec<Record<Event>> {
        (0..n)
            .map(|i| {
                Record::new(
                    format!("e{i}"),
                    Event::new(format!("boom {i}"), "error"),
                    100.0 + i as f64,
                )
            })
            .collect()
    }

    #[test]
    fn test_summary_for_project_timeline() {
        let renderer = SummaryRenderer::default();
        let n = renderer
            .render_digest(Ulid::new(), "mail:p:42", &records(2), 1)
            .unwrap();
        assert_eq!(n.subject, "2 new events in project 42");
        assert_eq!(n.project.as_deref(), Some("42"));
        assert_eq!(n.lines, vec!["[error] boom 0 (e0)", "[error] boom 1 (e1)"]);
        assert_eq!(n.count, 2);
        assert_eq!(n.skipped, 1);
    }

    #[test]
    fn test_summary_folds_long_digests() {
        let renderer = SummaryRenderer { max_lines: 3 };
        let n = renderer
            .render_digest(Ulid::new(), "adhoc", &records(5), 0)
            .unwrap();
        assert_eq!(n.subject, "5 new events on adhoc");
        assert_eq!(n.lines.len(), 4);
        assert_eq!(n.lines[3], "... and 2 more");
    }

    #[test]
    fn test_outbox_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let outbox = OutboxNotifier::new(dir.path().join("out/outbox.jsonl"));
        let renderer = SummaryRenderer::default();

        for timeline in ["a:p:1", "a:p:2"] {
            let n = renderer
                .render_digest(Ulid::new(), timeline, &records(1), 0)
                .unwrap();
            outbox.send(&n).unwrap();
        }

        let sent = OutboxNotifier::read_all(outbox.path()).unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].subject, "1 new event in project 1");
        assert_eq!(sent[1].timeline, "a:p:2");
    }
}
