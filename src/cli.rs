//! Command line arguments (ambient): `argh`-based, matching the shape
//! metricdog's `args.rs` uses for its own small daemon CLI.

use argh::FromArgs;
use log::LevelFilter;
use std::path::PathBuf;

fn default_logging() -> LevelFilter {
    LevelFilter::Info
}

/// Command line arguments for the agentcore update daemon.
#[derive(FromArgs)]
pub struct Arguments {
    /// path to the TOML config file [default: /etc/agentcore.toml]
    #[argh(option, short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// logging verbosity [trace|debug|info|warn|error]
    #[argh(option, short = 'l', long = "log-level", default = "default_logging()")]
    pub log_level: LevelFilter,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
pub enum Command {
    Run(Run),
    ShowState(ShowState),
    Version(Version),
}

/// run the update agent loop until interrupted
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
pub struct Run {}

/// print the checkpointed state record, if any, and exit
#[derive(FromArgs)]
#[argh(subcommand, name = "show-state")]
pub struct ShowState {}

/// print the agent version and exit
#[derive(FromArgs)]
#[argh(subcommand, name = "version")]
pub struct Version {}
