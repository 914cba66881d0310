//! Show queue status

use super::Globals;
use crate::daemon::{self, Route};
use crate::ipc::{Request, Response, TimelineStatus};
use crate::{locks, util};
use anyhow::Result;
use digest_core::{now_secs, ScheduleIndex, TimelineState};
use owo_colors::OwoColorize;

/// Timelines listed per index before the rest are summarized
const LIST_LIMIT: usize = 20;

pub async fn run(globals: &Globals, timeline: Option<&str>) -> Result<()> {
    let config = globals.load()?;
    let now = now_secs();

    let request = Request::Status {
        timeline: timeline.map(str::to_string),
    };
    let (route, response) = daemon::dispatch(&config, request, false).await?;
    let Response::Status(report) = response else {
        anyhow::bail!("Unexpected reply to status: {:?}", response);
    };

    if let Some(status) = report.timeline {
        show_timeline(&status, now);
        return Ok(());
    }

    let data_dir = config.data_dir();
    println!("{}", "Digest Status".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("Data dir:      {}", data_dir.display().to_string().cyan());
    println!("Outbox:        {}", util::outbox_path(&config).display());

    print!("Daemon:        ");
    match route {
        Route::Daemon => println!("{}", "Running".green()),
        Route::Local => println!("{}", "Not running".dimmed()),
    }

    print!("Tick lock:     ");
    match locks::current_holder(&data_dir)? {
        Some(holder) if locks::is_process_alive(holder.pid) => {
            println!("{} (pid {})", "Held".yellow(), holder.pid);
        }
        _ => println!("{}", "Free".green()),
    }
    println!();

    for index in [ScheduleIndex::Waiting, ScheduleIndex::Ready] {
        let entries = match index {
            ScheduleIndex::Waiting => &report.waiting,
            ScheduleIndex::Ready => &report.ready,
        };
        println!("{} {}", index.as_str().bold(), format!("({})", entries.len()).dimmed());
        if entries.is_empty() {
            println!("  {}", "none".dimmed());
        }
        for entry in entries.iter().take(LIST_LIMIT) {
            let when = util::format_relative_time(entry.timestamp, now);
            let label = match index {
                ScheduleIndex::Waiting => format!("due {}", when),
                ScheduleIndex::Ready => format!("ready since {}", when),
            };
            println!("  {}  {}", entry.timeline.cyan(), label.dimmed());
        }
        if entries.len() > LIST_LIMIT {
            println!("  {}", format!("... and {} more", entries.len() - LIST_LIMIT).dimmed());
        }
        println!();
    }

    Ok(())
}

fn show_timeline(status: &TimelineStatus, now: f64) {
    println!("{}", status.timeline.bold());

    let Some(state) = status.state else {
        println!("  {}", "No such timeline".yellow());
        return;
    };

    match state {
        TimelineState::Waiting { due } => println!(
            "  State:       {} (due {})",
            "waiting".green(),
            util::format_relative_time(due, now)
        ),
        TimelineState::Ready { since } => println!(
            "  State:       {} (since {})",
            "ready".yellow(),
            util::format_relative_time(since, now)
        ),
    }
    println!("  Records:     {}", status.records);
}
