//! Request handling for the running scheduler
//!
//! The sled store allows one opener at a time, so while `digestd run` is
//! up every other command goes through its socket. With no daemon the
//! command opens the store itself and handles the request in-process.

use crate::ipc::{self, Handler, IpcClient, Request, Response, StatusReport, TimelineStatus};
use crate::notify::SummaryRenderer;
use crate::scheduler::Scheduler;
use crate::system_config::SystemConfig;
use crate::util;
use anyhow::{Context, Result};
use digest_core::{now_secs, ScheduleIndex};
use digests::{AddOptions, Backend, Digests};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Daemon,
    Local,
}

/// Answer one request against `scheduler`'s backend
pub fn handle(scheduler: &Scheduler<Backend>, request: Request) -> Response {
    match execute(scheduler, request) {
        Ok(response) => response,
        Err(e) => Response::Error {
            message: format!("{e:#}"),
        },
    }
}

/// Handler serving `scheduler` over the socket
pub fn handler(scheduler: Arc<Scheduler<Backend>>) -> Handler {
    Arc::new(move |request| handle(&scheduler, request))
}

fn execute(scheduler: &Scheduler<Backend>, request: Request) -> Result<Response> {
    let backend = scheduler.backend();
    match request {
        Request::Ping => Ok(Response::Pong {
            pid: std::process::id(),
        }),
        Request::Add {
            timeline,
            record,
            increment_delay,
            maximum_delay,
        } => {
            let options = AddOptions {
                increment_delay,
                maximum_delay,
                timestamp: None,
            };
            let created = backend
                .add(&timeline, &record, options)
                .with_context(|| format!("Failed to add record to {}", timeline))?;
            backend.flush()?;
            Ok(Response::Added { created })
        }
        Request::Delete { timeline } => {
            let existed = backend.state(&timeline)?.is_some();
            backend
                .delete(&timeline)
                .with_context(|| format!("Failed to delete {}", timeline))?;
            backend.flush()?;
            Ok(Response::Deleted { existed })
        }
        Request::Status { timeline } => Ok(Response::Status(status_report(
            backend,
            timeline.as_deref(),
        )?)),
        Request::Tick { now } => {
            let report = scheduler.tick(now.unwrap_or_else(now_secs))?;
            backend.flush()?;
            Ok(Response::Ticked(report))
        }
    }
}

fn status_report(backend: &Backend, timeline: Option<&str>) -> Result<StatusReport> {
    let Some(timeline) = timeline else {
        return Ok(StatusReport {
            waiting: backend.entries(ScheduleIndex::Waiting)?,
            ready: backend.entries(ScheduleIndex::Ready)?,
            timeline: None,
        });
    };

    let state = backend.state(timeline)?;
    let records = match state {
        Some(_) => backend.store().live_len(timeline)?,
        None => 0,
    };
    Ok(StatusReport {
        timeline: Some(TimelineStatus {
            timeline: timeline.to_string(),
            state,
            records,
        }),
        ..StatusReport::default()
    })
}

/// Scheduler over a store opened by this process. A fixed `now` also
/// pins the backend clock.
pub fn local_scheduler(
    config: &SystemConfig,
    now: Option<f64>,
    log_only: bool,
) -> Result<Scheduler<Backend>> {
    let mut backend = util::open_backend(config)?;
    if let Some(fixed) = now {
        backend = backend.with_clock(Arc::new(move || fixed));
    }
    Ok(Scheduler::new(
        backend,
        Box::new(SummaryRenderer::default()),
        util::notifier(config, log_only),
        util::scheduler_settings(config),
    ))
}

/// Send `request` to the daemon if one is running, else handle it here.
/// Error replies become errors.
pub async fn dispatch(
    config: &SystemConfig,
    request: Request,
    log_only: bool,
) -> Result<(Route, Response)> {
    let path = ipc::socket_path(&config.data_dir());

    let (route, response) = match IpcClient::connect(&path).await? {
        Some(mut client) => {
            if matches!(request, Request::Tick { now: Some(_) }) {
                anyhow::bail!("The daemon owns the store; --now needs it stopped");
            }
            if log_only {
                warn!("daemon is running, --log-only ignored");
            }
            debug!(path = %path.display(), "forwarding request to daemon");
            (Route::Daemon, client.request(&request).await?)
        }
        None => {
            let config = config.clone();
            let response = tokio::task::spawn_blocking(move || -> Result<Response> {
                let now = match &request {
                    Request::Tick { now } => *now,
                    _ => None,
                };
                let scheduler = local_scheduler(&config, now, log_only)?;
                Ok(handle(&scheduler, request))
            })
            .await
            .context("Request task failed")??;
            (Route::Local, response)
        }
    };

    if let Response::Error { message } = response {
        anyhow::bail!("{}", message);
    }
    Ok((route, response))
}
