use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "ktails",
    version,
    about = "Watch pods, deployments and live logs across several Kubernetes contexts at once."
)]
pub struct CliArgs {
    /// Context to select on startup (repeatable)
    #[arg(short = 'c', long = "context")]
    pub contexts: Vec<String>,

    /// Namespace for every context selected during the session (the `n`
    /// prompt still changes it per context)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Watch all namespaces of every selected context
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Periodic refresh interval in seconds (0 disables)
    #[arg(long)]
    pub refresh_secs: Option<u64>,

    /// Lines kept per log pane
    #[arg(long)]
    pub max_log_lines: Option<usize>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Write tracing output to this file instead of discarding it
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}
