//! Delete a timeline

use super::Globals;
use crate::daemon;
use crate::ipc::{Request, Response};
use anyhow::Result;
use owo_colors::OwoColorize;

pub async fn run(globals: &Globals, timeline: &str) -> Result<()> {
    let config = globals.load()?;

    let request = Request::Delete {
        timeline: timeline.to_string(),
    };
    let (_, response) = daemon::dispatch(&config, request, false).await?;

    if matches!(response, Response::Deleted { existed: true }) {
        println!("{} Deleted {}", "✓".green(), timeline.cyan());
    } else {
        println!("{} {}", timeline.cyan(), "did not exist".dimmed());
    }
    Ok(())
}
