use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::settings::Settings;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("DEVDECK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// Stdout is reserved for command output, so logs go to
/// `<data_root>/logs/devdeck.log.<date>`; `verbose` mirrors them to stderr.
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(settings: &Settings, verbose: bool) -> anyhow::Result<WorkerGuard> {
    let dir = settings.log_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("create log dir {}", dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "devdeck.log"));

    let file_layer = fmt::layer().with_ansi(false).with_writer(writer);
    let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("install tracing subscriber")?;

    Ok(guard)
}
