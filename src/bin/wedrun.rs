//! wedrun CLI
//!
//! Runs an experiment on the local machine: parses the WED-Makefile,
//! instantiates it from the configuration script, and drives it with a
//! pool of workers. Exits 0 iff a final state was reached.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wedrun::{ExperimentInstance, InstanceOptions, WedMakefile};

#[derive(Parser)]
#[command(name = "wedrun")]
#[command(about = "Run a WED-Makefile experiment on the local machine")]
#[command(version)]
struct Cli {
    /// Path to the WED-Makefile containing the experiment specification
    wedmakefile: PathBuf,

    /// Path to the configuration script producing the initial state
    config: PathBuf,

    /// Number of worker threads
    #[arg(default_value_t = 1)]
    workers: usize,

    /// Disable the log directory and per-task stdout/stderr files
    #[arg(long)]
    no_log: bool,

    /// Log every variable update and the final state
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let makefile = WedMakefile::from_path(&cli.wedmakefile)
        .with_context(|| format!("failed to load {}", cli.wedmakefile.display()))?;
    let instance = ExperimentInstance::new(
        makefile,
        &cli.config,
        InstanceOptions { log: !cli.no_log },
    )
    .with_context(|| format!("failed to instantiate from {}", cli.config.display()))?;
    instance.run(cli.workers)?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    match run(&cli) {
        Ok(()) => {
            println!("Success!");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::FAILURE
        }
    }
}
