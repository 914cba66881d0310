//! The scheduler task
//!
//! Each tick recovers timelines stuck in ready, moves due timelines to
//! ready, then digests and delivers them one by one. A failed delivery
//! leaves its timeline ready; the records go out on a later attempt.

use crate::locks::TickLock;
use crate::notify::{Event, Notifier, Renderer};
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use digest_core::{now_secs, project_of};
use digests::{BackendError, DigestOutcome, Digests};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Where and how to take the tick lock
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub dir: PathBuf,
    pub lease: Duration,
    pub retries: u32,
    pub wait: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long a timeline may stay ready before maintenance requeues it
    pub ready_timeout: Duration,
    pub retry: RetryPolicy,
    /// Serialize ticks across processes sharing a data directory
    pub lock: Option<LockSettings>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
            lock: None,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Another process held the tick lock; nothing was done
    pub skipped: bool,
    /// Timelines returned from ready to waiting by maintenance
    pub recovered: usize,
    /// Timelines moved from waiting to ready
    pub scheduled: usize,
    /// Notifications sent
    pub delivered: usize,
    /// Records included in those notifications
    pub records: usize,
    /// Digests that had nothing deliverable
    pub empty: usize,
    /// Timelines of disabled projects, deleted
    pub deleted: usize,
    /// Deliveries that failed and stay queued
    pub failed: usize,
    /// Stopped early because the lock lease ran out
    pub deferred: bool,
}

/// Result of delivering one timeline
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Sent {
        records: usize,
        outcome: DigestOutcome,
    },
    Empty,
    Disabled,
}

pub struct Scheduler<B> {
    backend: B,
    renderer: Box<dyn Renderer>,
    notifier: Box<dyn Notifier>,
    settings: SchedulerSettings,
}

fn is_retriable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BackendError>()
        .is_some_and(BackendError::is_retriable)
}

impl<B: Digests> Scheduler<B> {
    pub fn new(
        backend: B,
        renderer: Box<dyn Renderer>,
        notifier: Box<dyn Notifier>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            backend,
            renderer,
            notifier,
            settings,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one scheduler pass at time `now`
    pub fn tick(&self, now: f64) -> Result<TickReport> {
        let mut report = TickReport::default();

        let lock = match &self.settings.lock {
            Some(lock) => {
                match TickLock::acquire(&lock.dir, lock.lease, lock.retries, lock.wait)? {
                    Some(held) => Some(held),
                    None => {
                        report.skipped = true;
                        return Ok(report);
                    }
                }
            }
            None => None,
        };

        let retry = self.settings.retry;
        let deadline = now - self.settings.ready_timeout.as_secs_f64();
        report.recovered = retry
            .run(
                || self.backend.maintenance(deadline, Some(now)),
                BackendError::is_retriable,
                |attempt, e, delay| warn!(attempt, ?delay, "maintenance failed, retrying: {e}"),
            )
            .context("Maintenance failed")?;

        for entry in self.backend.schedule(now, Some(now)) {
            let entry = entry.context("Schedule failed")?;
            report.scheduled += 1;

            if lock.as_ref().is_some_and(|held| !held.is_valid()) {
                warn!(timeline = %entry.timeline, "tick lease expired, leaving the rest for later");
                report.deferred = true;
                break;
            }

            match self.deliver(&entry.timeline) {
                Ok(Delivery::Sent { records, .. }) => {
                    report.delivered += 1;
                    report.records += records;
                }
                Ok(Delivery::Empty) => report.empty += 1,
                Ok(Delivery::Disabled) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(timeline = %entry.timeline, "delivery failed, timeline stays queued: {e:#}");
                }
            }
        }

        drop(lock);
        Ok(report)
    }

    /// Digest one ready timeline and hand it to the notifier
    pub fn deliver(&self, timeline: &str) -> Result<Delivery> {
        let retry = self.settings.retry;

        if let Some(project) = project_of(timeline) {
            if !self.backend.enabled(project) {
                retry.run(
                    || self.backend.delete(timeline),
                    BackendError::is_retriable,
                    |attempt, e, delay| warn!(timeline, attempt, ?delay, "delete failed, retrying: {e}"),
                )?;
                info!(timeline, project, "project disabled, timeline dropped");
                return Ok(Delivery::Disabled);
            }
        }

        retry.run(
            || self.attempt(timeline),
            is_retriable,
            |attempt, e, delay| warn!(timeline, attempt, ?delay, "delivery failed, retrying: {e:#}"),
        )
    }

    fn attempt(&self, timeline: &str) -> Result<Delivery> {
        let digest = self.backend.begin_digest::<Event>(timeline, None)?;

        if digest.is_empty() {
            let skipped = digest.skipped();
            let outcome = digest.commit()?;
            debug!(timeline, skipped, ?outcome, "nothing to deliver");
            return Ok(Delivery::Empty);
        }

        let notification = self
            .renderer
            .render_digest(digest.id(), timeline, digest.records(), digest.skipped())
            .context("Failed to render digest")?;
        self.notifier
            .send(&notification)
            .context("Failed to send notification")?;

        let records = digest.records().len();
        let outcome = digest.commit()?;
        info!(timeline, records, ?outcome, "digest delivered");
        Ok(Delivery::Sent { records, outcome })
    }
}

impl<B: Digests + Send + Sync + 'static> Scheduler<B> {
    /// Tick every `every` until Ctrl-C, or until `max_ticks` ticks ran.
    /// Returns the number of ticks run.
    pub async fn run(self: Arc<Self>, every: Duration, max_ticks: Option<u64>) -> Result<u64> {
        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Starting scheduler (interval: {:?})", every);

        let mut ticks = 0u64;
        loop {
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }

            tokio::select! {
                _ = timer.tick() => {
                    let scheduler = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || scheduler.tick(now_secs())).await {
                        Ok(Ok(report)) => log_report(&report),
                        Ok(Err(e)) => warn!("Scheduler tick failed: {e:#}"),
                        Err(e) => warn!("Scheduler tick panicked: {e}"),
                    }
                    ticks += 1;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, stopping scheduler");
                    break;
                }
            }
        }

        Ok(ticks)
    }
}

fn log_report(report: &TickReport) {
    if report.skipped {
        debug!("Tick skipped, lock held elsewhere");
    } else if report.scheduled > 0 || report.recovered > 0 {
        info!(
            recovered = report.recovered,
            scheduled = report.scheduled,
            delivered = report.delivered,
            records = report.records,
            deleted = report.deleted,
            failed = report.failed,
            "Tick finished"
        );
    } else {
        debug!("Tick finished, nothing due");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Notification, SummaryRenderer};
    use digest_core::{BackendOptions, Record, TimelineState};
    use digests::{AddOptions, Backend, ProjectSettings, StaticProjects};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Collects notifications; fails while `failing` is set
    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<Notification>>,
        failing: AtomicBool,
        attempts: AtomicUsize,
    }

    impl Notifier for Arc<Capture> {
        fn send(&self, notification: &Notification) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("smtp unavailable");
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn scheduler(backend: Backend) -> (Scheduler<Backend>, Arc<Capture>) {
        let capture = Arc::new(Capture::default());
        let settings = SchedulerSettings {
            ready_timeout: Duration::from_secs(600),
            retry: RetryPolicy::new(2, 1, 1),
            lock: None,
        };
        let scheduler = Scheduler::new(
            backend,
            Box::new(SummaryRenderer::default()),
            Box::new(Arc::clone(&capture)),
            settings,
        );
        (scheduler, capture)
    }

    fn backend() -> Backend {
        Backend::in_memory(BackendOptions::default())
            .unwrap()
            .with_clock(Arc::new(|| 1_000.0))
    }

    fn add(backend: &Backend, timeline: &str, key: &str, timestamp: f64) {
        backend
            .add(
                timeline,
                &Record::new(key, Event::new(format!("event {key}"), "error"), timestamp),
                AddOptions::default(),
            )
            .unwrap();
    }

    #[test]
    fn test_tick_delivers_due_timelines() {
        let (scheduler, capture) = scheduler(backend());
        add(scheduler.backend(), "mail:p:1", "a", 900.0);
        add(scheduler.backend(), "mail:p:1", "b", 901.0);
        add(scheduler.backend(), "mail:p:2", "c", 2_000.0);

        let report = scheduler.tick(1_000.0).unwrap();
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.records, 2);

        let sent = capture.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "2 new events in project 1");
        assert_eq!(scheduler.backend().state("mail:p:1").unwrap(), None);
        assert!(scheduler.backend().state("mail:p:2").unwrap().is_some());
    }

    #[test]
    fn test_failed_send_keeps_records_for_next_tick() {
        let (scheduler, capture) = scheduler(backend());
        add(scheduler.backend(), "mail:p:1", "a", 900.0);

        capture.failing.store(true, Ordering::SeqCst);
        let report = scheduler.tick(1_000.0).unwrap();
        assert_eq!(report.failed, 1);
        // Send errors are not storage errors, so no retry
        assert_eq!(capture.attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            scheduler.backend().state("mail:p:1").unwrap(),
            Some(TimelineState::Ready { .. })
        ));

        // Still ready: schedule will not pick it up, maintenance will
        capture.failing.store(false, Ordering::SeqCst);
        add(scheduler.backend(), "mail:p:1", "b", 950.0);
        let report = scheduler.tick(1_000.0 + 601.0).unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.records, 2);
    }

    #[test]
    fn test_disabled_project_is_dropped() {
        let projects = StaticProjects::new().with(
            "9",
            ProjectSettings {
                enabled: false,
                ..Default::default()
            },
        );
        let (scheduler, capture) = scheduler(backend().with_projects(Arc::new(projects)));
        add(scheduler.backend(), "mail:p:9", "a", 900.0);

        let report = scheduler.tick(1_000.0).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(capture.sent.lock().unwrap().is_empty());
        assert_eq!(scheduler.backend().state("mail:p:9").unwrap(), None);
    }

    #[test]
    fn test_busy_lock_skips_tick() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut scheduler, _capture) = scheduler(backend());
        scheduler.settings.lock = Some(LockSettings {
            dir: dir.path().to_path_buf(),
            lease: Duration::from_secs(30),
            retries: 0,
            wait: Duration::from_millis(1),
        });
        add(scheduler.backend(), "mail:p:1", "a", 900.0);

        let held = TickLock::acquire(dir.path(), Duration::from_secs(30), 0, Duration::ZERO)
            .unwrap()
            .unwrap();
        let report = scheduler.tick(1_000.0).unwrap();
        assert!(report.skipped);
        assert_eq!(report.scheduled, 0);

        drop(held);
        let report = scheduler.tick(1_000.0).unwrap();
        assert!(!report.skipped);
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_run_stops_after_max_ticks() {
        let (scheduler, capture) = scheduler(
            Backend::in_memory(BackendOptions::default()).unwrap(),
        );
        add(scheduler.backend(), "mail:p:1", "a", now_secs() - 10.0);

        let ticks = Arc::new(scheduler)
            .run(Duration::from_millis(10), Some(2))
            .await
            .unwrap();
        assert_eq!(ticks, 2);
        assert_eq!(capture.sent.lock().unwrap().len(), 1);
    }
}
