//! Tracing bootstrap for the digestd binary

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,digestd=info,digests=info,timeline=warn";
const VERBOSE_FILTER: &str = "info,digestd=debug,digests=debug,timeline=debug";

/// Install the global subscriber.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `DIGESTD_LOG`
/// 3) built-in default (more detailed with `verbose`)
///
/// With `log_dir`, output also goes to a daily-rotated file; keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = filter_from_env(verbose);
    let builder = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "digestd.log");
            let (file, guard) = tracing_appender::non_blocking(appender);
            let _ = builder
                .with_writer(std::io::stderr.and(file))
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
            None
        }
    }
}

fn filter_from_env(verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(filter) = env::var("DIGESTD_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
    {
        return filter;
    }

    EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
}
