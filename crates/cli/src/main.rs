//! digestd command line

use anyhow::Result;
use clap::{Parser, Subcommand};
use digestd::cmd::{self, add::AddArgs, Globals};
use digestd::{logging, system_config};
use std::path::PathBuf;

/// digestd - batch events into per-timeline notification digests
#[derive(Parser)]
#[command(name = "digestd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/digestd/config.toml)
    #[arg(long, global = true, env = "DIGESTD_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory, overriding [store].path
    #[arg(long, global = true, env = "DIGESTD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// More detailed logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an event on a timeline
    Add {
        /// Timeline id (or project id with --project)
        timeline: String,
        /// Record key, unique within the timeline
        key: String,
        /// Treat TIMELINE as a project id in the configured namespace
        #[arg(short, long)]
        project: bool,
        /// Event message
        #[arg(short, long)]
        message: String,
        /// Event level
        #[arg(short, long, default_value = "info")]
        level: String,
        /// Tag as key=value (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Event time in unix seconds (default: now)
        #[arg(long)]
        timestamp: Option<f64>,
        /// Override the increment delay for this add
        #[arg(long)]
        increment_delay: Option<f64>,
        /// Override the maximum delay for this add
        #[arg(long)]
        maximum_delay: Option<f64>,
    },
    /// Run one scheduler pass
    Tick {
        /// Pretend the current time is this unix timestamp
        #[arg(long)]
        now: Option<f64>,
        /// Log notifications instead of writing the outbox
        #[arg(long)]
        log_only: bool,
        /// Print the tick report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the scheduler until Ctrl-C
    Run {
        /// Seconds between ticks (default: scheduler.interval_secs)
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
        /// Log notifications instead of writing the outbox
        #[arg(long)]
        log_only: bool,
    },
    /// Show queued timelines
    Status {
        /// Show a single timeline
        #[arg(long)]
        timeline: Option<String>,
    },
    /// Delete a timeline and its records
    Delete {
        timeline: String,
    },
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Print the config file path
    Path {
        /// Create the file with defaults if missing
        #[arg(long)]
        create: bool,
    },
    /// Write the example config if none exists
    Init,
    /// Print an example config
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let globals = Globals {
        config: cli.config,
        data_dir: cli.data_dir,
    };

    // Log dir comes from the config; a broken config is reported by the command itself
    let log_dir = system_config::load(globals.config.as_deref())
        .ok()
        .and_then(|c| c.scheduler.log_dir);
    let _guard = logging::init(cli.verbose, log_dir.as_deref());

    match cli.command {
        Commands::Add {
            timeline,
            key,
            project,
            message,
            level,
            tags,
            timestamp,
            increment_delay,
            maximum_delay,
        } => cmd::add::run(
            &globals,
            AddArgs {
                timeline,
                project,
                key,
                message,
                level,
                tags,
                timestamp,
                increment_delay,
                maximum_delay,
            },
        )
        .await,
        Commands::Tick { now, log_only, json } => cmd::tick::run(&globals, now, log_only, json).await,
        Commands::Run {
            interval,
            ticks,
            log_only,
        } => cmd::run::run(&globals, interval, ticks, log_only).await,
        Commands::Status { timeline } => cmd::status::run(&globals, timeline.as_deref()).await,
        Commands::Delete { timeline } => cmd::delete::run(&globals, &timeline).await,
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::Show => cmd::config::run_show(&globals),
            ConfigCommands::Path { create } => cmd::config::run_path(&globals, create),
            ConfigCommands::Init => cmd::config::run_init(&globals),
            ConfigCommands::Example => cmd::config::run_example(),
        },
    }
}
