//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Tracing subscriber bootstrap with a dedicated error channel."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::path::Path;

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "PROVISYNC_LOG";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Available log formats for stdout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Subscriber for the window before the configuration names a log directory:
/// warnings and errors on stderr, nothing on disk. Install it with
/// `tracing::subscriber::with_default` around configuration loading.
pub fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    fmt()
        .with_target(false)
        .with_max_level(LevelFilter::WARN)
        .with_writer(std::io::stderr)
        .finish()
}

/// Initialize the tracing subscriber.
///
/// * `PROVISYNC_LOG` overrides the filter; otherwise `RUST_LOG` is honoured and
///   the default is `info`.
/// * Progress goes to stdout and to a daily rolling JSON file.
/// * Warnings and errors are additionally written to `<prefix>-<service>-errors.log`
///   so operators can watch failures without the informational noise.
pub fn init_tracing(service_name: &str, log_dir: &Path, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| "provisync".to_owned());

    let (file_writer, file_guard) = tracing_appender::non_blocking(daily(
        log_dir,
        format!("{}-{}.log", prefix, service_name),
    ));
    let (error_writer, error_guard) = tracing_appender::non_blocking(daily(
        log_dir,
        format!("{}-{}-errors.log", prefix, service_name),
    ));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = GUARDS.set(vec![file_guard, error_guard, stdout_guard]);

    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to info logging",
                LOG_ENV, err
            );
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    let error_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(error_writer)
        .with_filter(LevelFilter::WARN)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(error_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %log_dir.display(), format = ?config.format, "tracing initialised");
    Ok(())
}
