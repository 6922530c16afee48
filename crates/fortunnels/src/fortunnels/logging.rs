use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::fortunnels::config::LoggingConfig;

/// Keeps the non-blocking writer's flush guard alive for the process
/// lifetime; dropping it loses buffered log lines.
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Initialize tracing for the client.
///
/// `FORTUNNELS_LOG` (RUST_LOG directive syntax) overrides everything else;
/// otherwise the `--log-level` flag sets the client's level while the
/// protocol dependencies stay at warn so reconnect churn does not bury the
/// tunnel's own events.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = match std::env::var("FORTUNNELS_LOG") {
        Ok(spec) if !spec.trim().is_empty() => {
            EnvFilter::try_new(spec).context("logging: parse FORTUNNELS_LOG")?
        }
        _ => default_filter(&cfg.level)?,
    };

    let (writer, guard) = sink_for(cfg.output.trim())?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);

    let fmt_layer = if cfg.format.trim().eq_ignore_ascii_case("json") {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.with_ansi(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(LoggingRuntime { _guard: guard })
}

fn default_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level = level.trim().to_ascii_lowercase();
    let level = match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => level.as_str(),
        _ => "info",
    };
    let spec = format!(
        "{level},tungstenite=warn,tokio_tungstenite=warn,quinn=warn,webrtc_dtls=warn,tokio_yamux=warn"
    );
    EnvFilter::try_new(spec).context("logging: build filter")
}

fn sink_for(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        path => {
            let path = Path::new(path);
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("logging: create {}", dir.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open {}", path.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::default_filter;

    #[test]
    fn default_filter_accepts_known_levels_and_falls_back() {
        for level in ["trace", "debug", "info", "warn", "error", "verbose", ""] {
            assert!(default_filter(level).is_ok(), "{level}");
        }
    }
}
