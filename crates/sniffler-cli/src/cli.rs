//! Argument parsing. Grounded on `mockforge-cli`'s top-level `#[derive(Parser)]`
//! struct: one flat set of `#[arg(long, help_heading = "...")]` fields rather
//! than a subcommand tree, since this binary has exactly one job — boot the
//! supervisor.

use clap::Parser;

/// The Sniffler intercepting-proxy supervisor.
#[derive(Parser, Debug)]
#[command(name = "sniffler", version, about = "Developer-facing intercepting proxy suite")]
pub struct Cli {
    /// Log level (overridden by `RUST_LOG` when set).
    #[arg(short = 'v', long, default_value = "info", help_heading = "Logging")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, help_heading = "Logging")]
    pub json_logs: bool,

    /// Suppress the startup banner; only `tracing` output is produced.
    #[arg(long, help_heading = "Process")]
    pub hidden: bool,

    /// Persistence root directory (defaults to the platform user data dir).
    #[arg(long, help_heading = "Process")]
    pub data_dir: Option<std::path::PathBuf>,

    /// Declare a proxy to create on first run if its port isn't already
    /// configured. Format: `normal:<port>:<name>:<target_host>:<target_port>`,
    /// `db:<port>:<name>:<target_host>:<target_port>[:<protocol>]`, or
    /// `outgoing:<port>:<name>`. Repeatable.
    #[arg(long = "proxy", help_heading = "Proxies", action = clap::ArgAction::Append)]
    pub proxies: Vec<crate::config::ProxySpec>,

    /// Gate mock serving across all three transports.
    #[arg(long, help_heading = "Settings")]
    pub testing_mode: bool,

    /// Disable exact/pattern mock matching (enabled by default).
    #[arg(long, help_heading = "Settings")]
    pub no_pattern_matching: bool,

    /// Auto-save unmatched live responses as mocks.
    #[arg(long, help_heading = "Settings")]
    pub auto_save_as_mocks: bool,

    /// Allow mock serving on the outgoing (MITM) proxy.
    #[arg(long, help_heading = "Settings")]
    pub mock_outgoing: bool,

    /// Allow mock serving on db proxies.
    #[arg(long, help_heading = "Settings")]
    pub mock_db: bool,

    /// Disable the db health-check filter (enabled by default).
    #[arg(long, help_heading = "Settings")]
    pub no_filter_health_checks: bool,

    /// Disable auto-starting proxies at boot (enabled by default).
    #[arg(long, help_heading = "Settings")]
    pub no_global_auto_start: bool,
}
