//! ---
//! ps_section: "05-networking-external-interfaces"
//! ps_subsection: "binary"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Operator CLI driving one reconciliation invocation."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use provisync_common::{bootstrap_subscriber, init_tracing, AppConfig};
use provisync_core::{CancelToken, Collaborators, ReconcileError, RunCoordinator, TaskSelection};
use provisync_logging::{ps_error, ps_info, ps_warn, LogContext};
use provisync_persistence::HistoryStore;
use tokio::signal;
use tracing::warn;

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["provisync.toml", "/etc/provisync/provisync.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Reconcile subscriber flows and shaper policy onto a managed device",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TaskArg {
    Subscriber,
    Shaper,
    Both,
}

impl From<TaskArg> for TaskSelection {
    fn from(value: TaskArg) -> Self {
        match value {
            TaskArg::Subscriber => TaskSelection::Subscriber,
            TaskArg::Shaper => TaskSelection::Shaper,
            TaskArg::Both => TaskSelection::Both,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Reconcile the selected tasks and push any change")]
    Run {
        #[arg(value_enum)]
        tasks: TaskArg,
    },
    #[command(about = "Compute the change for the selected tasks without pushing it")]
    Plan {
        #[arg(value_enum)]
        tasks: TaskArg,
    },
    #[command(about = "Print recent run records")]
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    if cli.version {
        println!("provisyncctl {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }
    let Some(command) = cli.command else {
        eprintln!("error: a command is required (run, plan or history); see --help");
        return ExitCode::FAILURE;
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: unable to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(execute(cli.config, command));
    // after a second interrupt the pipeline thread may still be blocked on a child process
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(config_path: Option<PathBuf>, command: Commands) -> Result<()> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = config_path {
        candidates.push(path);
    }
    candidates.extend(DEFAULT_CONFIG_CANDIDATES.iter().map(PathBuf::from));

    // failures before the configured subscriber exists still reach stderr
    let (loaded, paths) = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        let prepared = AppConfig::load_with_source(&candidates).and_then(|loaded| {
            let paths = loaded.config.paths()?;
            init_tracing("provisyncctl", &paths.log_dir, &loaded.config.logging)?;
            Ok((loaded, paths))
        });
        if let Err(err) = &prepared {
            ps_error!("configuration could not be loaded: {:#}", err);
        }
        prepared
    })?;
    let config = Arc::new(loaded.config);
    ps_info!("configuration loaded from {}", loaded.source.display());

    match command {
        Commands::History { limit } => {
            let history = HistoryStore::open(&paths.history_dir)
                .with_context(|| format!("unable to open history at {}", paths.history_dir.display()))?;
            let runs = history.recent_runs(limit)?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            Ok(())
        }
        Commands::Run { tasks } => {
            let selection = TaskSelection::from(tasks);
            let collaborators = Collaborators::from_config(config.clone());
            let cancel = CancelToken::new();
            let mut coordinator = RunCoordinator::new(config, paths, collaborators).with_cancel(cancel.clone());
            let summary = interruptible(selection, cancel, move || coordinator.run(selection)).await?;
            println!("{}", serde_json::to_string_pretty(&summary.runs)?);
            Ok(())
        }
        Commands::Plan { tasks } => {
            let selection = TaskSelection::from(tasks);
            let collaborators = Collaborators::from_config(config.clone());
            let cancel = CancelToken::new();
            let mut coordinator = RunCoordinator::new(config, paths, collaborators).with_cancel(cancel.clone());
            let plans = interruptible(selection, cancel, move || coordinator.plan(selection)).await?;
            println!("{}", serde_json::to_string_pretty(&plans)?);
            Ok(())
        }
    }
}

/// Run the blocking pipeline while watching for an operator interrupt.
///
/// The first interrupt raises the stop flag and waits for the pipeline to
/// reach a step boundary, so the interrupted task is recorded as failed. A
/// second interrupt abandons the run immediately.
async fn interruptible<T, F>(selection: TaskSelection, cancel: CancelToken, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ReconcileError> + Send + 'static,
{
    let ctx = LogContext::new().with_task(selection.as_str());
    let mut handle = tokio::task::spawn_blocking(job);
    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = shutdown_signal() => {
            ps_warn!(context = ctx, "interrupt received; stopping at the next step boundary");
            cancel.cancel();
            tokio::select! {
                joined = &mut handle => joined,
                _ = shutdown_signal() => {
                    ps_error!(context = ctx, "second interrupt received; abandoning run");
                    return Err(anyhow!("interrupted"));
                }
            }
        }
    };
    match joined.context("pipeline task panicked")? {
        Ok(value) => {
            ps_info!(context = ctx, "invocation finished");
            Ok(value)
        }
        Err(err) => {
            ps_error!(context = ctx, "invocation failed ({}): {}", err.kind(), err);
            Err(err.into())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
