//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Shared primitives for the reconciliation workspace."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
//! Shared primitives for the provisync workspace.
//! This crate exposes configuration loading, explicit path resolution, and
//! the tracing bootstrap consumed by the engine and the operator CLI.

pub mod config;
pub mod logging;

pub use config::{
    render_command, AppConfig, FetchMode, LoadedAppConfig, LoggingConfig, PathsConfig,
    ResolvedPaths, ShaperTaskConfig, SourceConfig, SourceKind, SubscriberTaskConfig, TargetConfig,
    TargetKind, FILE_PLACEHOLDER,
};
pub use logging::{bootstrap_subscriber, init_tracing, LogFormat};
