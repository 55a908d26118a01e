//! prefork - worker supervision demo binary

mod cli;
mod demo;

use anyhow::Result;
use clap::Parser;
use prefork::config::SupervisorConfig;
use prefork::logging::{self, LogConfig};
use tracing::Level;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Demo(args) => cmd_demo(args),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

/// Set up tracing from CLI flags, then let the environment override.
fn init_logging(cli: &Cli) {
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let mut config = LogConfig::new().with_level(level);
    if cli.verbose > 0 {
        config = config.with_filter(format!("prefork={}", level).to_lowercase());
    }
    if cli.verbose > 1 {
        config = config.with_thread_ids(true);
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }

    logging::init(config.with_env_overrides());
}

fn cmd_demo(args: &cli::DemoArgs) -> Result<()> {
    let mut config = SupervisorConfig::default().with_env_overrides()?;
    if let Some(slots) = args.slots_per_page {
        config = config.with_slots_per_page(slots);
    }
    demo::run(args, &config)
}
