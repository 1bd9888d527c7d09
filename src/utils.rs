use std::collections::HashSet;
use std::fmt::Display;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use console::{Style, StyledObject};
use indicatif::ProgressStyle;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const ANSI_MAGENTA: Style = Style::new().magenta();
const ANSI_CYAN: Style = Style::new().cyan();

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "SITEPIPE_LOG";

/// Install the global subscriber. Progress bars of running task spans are
/// drawn by `tracing-indicatif`, and log lines are routed through its writer
/// so they don't tear the bars.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}

pub(crate) fn task_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Short human readable duration, e.g. `850µs`, `12.3ms`, `1.25s`.
pub fn fmt_duration(duration: Duration) -> String {
    let micros = duration.as_micros();

    if micros < 1_000 {
        format!("{micros}µs")
    } else if micros < 1_000_000 {
        format!("{:.1}ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.2}s", duration.as_secs_f64())
    }
}

pub(crate) fn paint_path<D: Display>(path: D) -> StyledObject<D> {
    ANSI_MAGENTA.apply_to(path)
}

pub(crate) fn paint_num<D: Display>(num: D) -> StyledObject<D> {
    ANSI_CYAN.apply_to(num)
}

/// Static part of a glob: everything before the first component holding a
/// wildcard.
pub fn glob_root(glob: &str) -> Utf8PathBuf {
    Utf8Path::new(glob)
        .components()
        .take_while(|c| !c.as_str().contains(['*', '?', '[']))
        .collect()
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive.
pub fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
