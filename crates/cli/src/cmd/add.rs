//! Queue an event on a timeline

use super::Globals;
use crate::daemon;
use crate::ipc::{Request, Response};
use crate::notify::Event;
use crate::util;
use anyhow::Result;
use digest_core::{now_secs, project_timeline, Record};
use owo_colors::OwoColorize;

pub struct AddArgs {
    /// Timeline id, or a bare project id with `project`
    pub timeline: String,
    pub project: bool,
    pub key: String,
    pub message: String,
    pub level: String,
    pub tags: Vec<String>,
    pub timestamp: Option<f64>,
    pub increment_delay: Option<f64>,
    pub maximum_delay: Option<f64>,
}

pub async fn run(globals: &Globals, args: AddArgs) -> Result<()> {
    let config = globals.load()?;

    let timeline = if args.project {
        project_timeline(&config.backend.namespace, &args.timeline)
    } else {
        args.timeline
    };

    let mut event = Event::new(args.message, args.level);
    for tag in &args.tags {
        let (key, value) = util::parse_tag(tag)?;
        event.tags.insert(key, value);
    }

    let timestamp = args.timestamp.unwrap_or_else(now_secs);
    let record = Record::new(args.key, event, timestamp);
    let key = record.key.clone();
    let request = Request::Add {
        timeline: timeline.clone(),
        record,
        increment_delay: args.increment_delay,
        maximum_delay: args.maximum_delay,
    };

    let (_, response) = daemon::dispatch(&config, request, false).await?;
    let created = matches!(response, Response::Added { created: true });

    if created {
        println!(
            "{} {} {}",
            "✓".green(),
            key.cyan(),
            format!("queued on new timeline {}", timeline).dimmed()
        );
    } else {
        println!("{} {} queued on {}", "✓".green(), key.cyan(), timeline);
    }

    Ok(())
}
