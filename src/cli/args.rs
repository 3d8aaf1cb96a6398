use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::types::BackendType;

#[derive(Parser, Debug)]
#[clap(name = "runlet")]
#[clap(version, about = "Sandboxed code execution with streamed output")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "RUNLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a source file in a sandbox and stream its output
    Run(RunArgs),

    /// Start the HTTP/WebSocket server
    Serve(ServeArgs),

    /// List isolation backends and whether they are usable here
    Backends,

    /// Initialize a new runlet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Execution Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source file to run, or "-" to read from stdin
    pub file: PathBuf,

    /// Language runtime (python, nodejs, shell); inferred from the file extension if omitted
    #[clap(long, short = 'l')]
    pub language: Option<String>,

    /// Wall-clock timeout in seconds
    #[clap(long, short = 't')]
    pub timeout: Option<u64>,

    /// Memory limit in MB
    #[clap(long, short = 'm')]
    pub memory: Option<u64>,

    /// Override the configured isolation backend
    #[clap(long, value_enum)]
    pub backend: Option<BackendType>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (overrides server.bind)
    #[clap(long, short = 'b')]
    pub bind: Option<String>,

    /// Override the configured isolation backend
    #[clap(long, value_enum)]
    pub backend: Option<BackendType>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
