//! Run the scheduler loop in the foreground
//!
//! While it runs, this process owns the store and answers other
//! commands over the daemon socket.

use super::Globals;
use crate::daemon;
use crate::ipc::{self, IpcServer};
use anyhow::Result;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub async fn run(
    globals: &Globals,
    interval_secs: Option<u64>,
    ticks: Option<u64>,
    log_only: bool,
) -> Result<()> {
    let config = globals.load()?;
    let interval = interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.scheduler.interval());

    // Bind before opening the store
    let server = IpcServer::bind(&ipc::socket_path(&config.data_dir())).await?;
    let scheduler = Arc::new(daemon::local_scheduler(&config, None, log_only)?);

    println!(
        "{} every {:?} on {} {}",
        "Scheduling digests".bold(),
        interval,
        server.path().display().to_string().cyan(),
        "(Ctrl-C to stop)".dimmed()
    );

    let serving = tokio::spawn(server.serve(daemon::handler(Arc::clone(&scheduler))));
    let ran = Arc::clone(&scheduler).run(interval, ticks).await;

    serving.abort();
    if let Err(e) = serving.await {
        if !e.is_cancelled() {
            warn!("IPC server stopped abnormally: {e}");
        }
    }
    let ran = ran?;
    scheduler.backend().flush()?;

    println!("{} Stopped after {} ticks", "✓".green(), ran);
    Ok(())
}
