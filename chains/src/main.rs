// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Command line runner for use-case files.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use chains::{PluginRegistry, Result, RunReport, UseCase, run};
use clap::{Parser, Subcommand};
use links::config::SystemConfig;

#[derive(Parser)]
#[command(name = "chains")]
#[command(author, version, about = "Runs link chains described by JSON use cases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a use case and print link statistics
    Run {
        /// Use-case file (JSON)
        #[arg(value_name = "USECASE")]
        usecase: PathBuf,

        /// How long to keep the chain running, in milliseconds
        #[arg(short, long, default_value = "5000")]
        duration_ms: u64,

        /// Platform configuration replacing the one in the use case (JSON)
        #[arg(long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Print the full report as JSON instead of a table
        #[arg(long)]
        stats: bool,
    },

    /// Check a use case's topology without running it
    Validate {
        #[arg(value_name = "USECASE")]
        usecase: PathBuf,
    },

    /// List the algorithm plugins use cases can name
    Plugins,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

fn print_table(report: &RunReport) {
    println!(
        "{} ran for {} ms (chain {})",
        report.usecase, report.elapsed_ms, report.chain_id
    );
    println!(
        "{:<20} {:>10} {:>10} {:>10} {:>10}",
        "LINK", "RECV", "DROP", "OUT", "ERRORS"
    );
    for link in &report.links {
        let stats = &link.statistics;
        println!(
            "{:<20} {:>10} {:>10} {:>10} {:>10}",
            link.id.to_string(),
            stats.total_recv(),
            stats.total_drop(),
            stats.total_out(),
            stats.in_buf_error_count
        );
    }
    for (sink, count) in &report.delivered {
        println!("{sink} delivered {count} buffers");
    }
}

fn execute(cli: Cli) -> Result<()> {
    let registry = PluginRegistry::default();
    match cli.command {
        Commands::Run {
            usecase,
            duration_ms,
            config,
            stats,
        } => {
            let mut usecase = UseCase::from_json_file(usecase)?;
            if let Some(path) = config {
                usecase.config = SystemConfig::from_json_file(path)?;
            }
            let report = run(&usecase, &registry, Duration::from_millis(duration_ms))?;
            if stats {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_table(&report);
            }
        }
        Commands::Validate { usecase } => {
            let usecase = UseCase::from_json_file(usecase)?;
            let chain = usecase.chain(&registry)?;
            println!("{}: {} links, valid", usecase.name, chain.link_ids().len());
            for id in chain.link_ids() {
                println!("  {id}");
            }
        }
        Commands::Plugins => {
            for name in registry.names() {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    setup_logging();
    match execute(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
