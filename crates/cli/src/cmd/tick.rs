//! Run a single scheduler pass

use super::Globals;
use crate::daemon::{self, Route};
use crate::ipc::{Request, Response};
use anyhow::Result;
use owo_colors::OwoColorize;

pub async fn run(globals: &Globals, now: Option<f64>, log_only: bool, json: bool) -> Result<()> {
    let config = globals.load()?;

    let (route, response) = daemon::dispatch(&config, Request::Tick { now }, log_only).await?;
    let Response::Ticked(report) = response else {
        anyhow::bail!("Unexpected reply to tick: {:?}", response);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.skipped {
        println!("{}", "Tick skipped: another scheduler holds the lock".yellow());
        return Ok(());
    }

    match route {
        Route::Daemon => println!("{} {}", "Tick complete".bold(), "(daemon)".dimmed()),
        Route::Local => println!("{}", "Tick complete".bold()),
    }
    println!("  Recovered:   {}", report.recovered);
    println!("  Scheduled:   {}", report.scheduled);
    println!(
        "  Delivered:   {} {}",
        report.delivered.to_string().green(),
        format!("({} records)", report.records).dimmed()
    );
    if report.empty > 0 {
        println!("  Empty:       {}", report.empty);
    }
    if report.deleted > 0 {
        println!("  Disabled:    {} deleted", report.deleted);
    }
    if report.failed > 0 {
        println!("  Failed:      {}", report.failed.to_string().red());
    }
    if report.deferred {
        println!("  {}", "Lease expired; remaining timelines left for the next tick".yellow());
    }
    Ok(())
}
