//! Command-line interface definitions using clap.

use clap::{ArgAction, Parser, Subcommand};
use nix::sys::signal::Signal;
use prefork::logging::LogFormat;
use prefork::worker::parse_signal;

/// Worker supervision toolkit for preforking servers.
#[derive(Parser, Debug)]
#[command(name = "prefork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fork workers, relay soft signals to them, then shut them down.
    Demo(DemoArgs),
}

/// Arguments for the demo command.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Number of worker processes to fork.
    #[arg(short, long, default_value_t = 2)]
    pub workers: usize,

    /// Soft signal to relay to every worker (repeatable), e.g. USR1 or SIGHUP.
    #[arg(short, long = "signal", value_parser = parse_signal_arg)]
    pub signals: Vec<Signal>,

    /// How long to watch heartbeats before shutting workers down (ms).
    #[arg(long, default_value_t = 300)]
    pub settle_ms: u64,

    /// Heartbeat slots per shared page (default: platform page size / 64).
    #[arg(long)]
    pub slots_per_page: Option<usize>,
}

fn parse_signal_arg(value: &str) -> Result<Signal, String> {
    parse_signal(value).map_err(|e| e.to_string())
}
