//! lazysched CLI - validate segment configurations and replay workloads.

mod workload;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use lazysched_core::{is_internal_segment_name, SchedulerConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workload::{run, verify, RunOptions, Workload};

#[derive(Parser)]
#[command(name = "lazysched")]
#[command(about = "Schedule-driven deferred execution of graph segments", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check segment declarations and the schedule
    Validate {
        /// Scheduler configuration (JSON)
        config: PathBuf,
    },
    /// Replay a workload under its schedule
    Run {
        /// Workload file (JSON)
        workload: PathBuf,
        /// Print the schedule diagnostics
        #[arg(long)]
        debug: bool,
        /// Compare outputs with strict in-order execution
        #[arg(long)]
        verify: bool,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Validate { config } => {
            let config = SchedulerConfig::from_path(&config)?;
            let table = config.validate()?;

            println!("Segments ({})", config.segments.len());
            for name in table.segment_names() {
                let segment = table.segment(name);
                println!(
                    "  {} | {} | {}",
                    name,
                    segment.map(|s| s.method.as_str()).unwrap_or("-"),
                    segment.and_then(|s| s.backend.as_deref()).unwrap_or("-"),
                );
            }
            println!("Schedule: {:?}", config.schedule);
            for entry in &config.schedule {
                if !table.is_user_specified(entry) {
                    warn!("Schedule entry {} is not a declared segment", entry);
                }
                if is_internal_segment_name(entry) {
                    warn!("Schedule entry {} uses a reserved prefix", entry);
                }
            }
            println!("OK");
        }
        Commands::Run { workload, debug, verify: check, json } => {
            let workload = Workload::from_path(&workload)?;
            let outcome = run(&workload, &RunOptions { debug, ..Default::default() })?;
            let mismatched = if check { Some(verify(&workload, &outcome)?) } else { None };

            if json {
                let mut value = serde_json::to_value(&outcome)?;
                if let Some(mismatched) = &mismatched {
                    value["verify"] = serde_json::json!({ "mismatched": mismatched });
                }
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Recorded execution order: {:?}", outcome.recorded);
                if !outcome.delayed.is_empty() {
                    println!("Delayed segments: {:?}", outcome.delayed);
                }
                for (name, tensor) in &outcome.outputs {
                    println!("  {} = {} {:?}", name, tensor.meta(), tensor.data());
                }
                if let Some(diagnostics) = &outcome.diagnostics {
                    println!();
                    println!("{}", diagnostics);
                }
                if let Some(mismatched) = &mismatched {
                    if mismatched.is_empty() {
                        info!("Outputs match strict in-order execution");
                        println!("Verify: OK");
                    } else {
                        println!("Verify: outputs differ from in-order execution: {:?}", mismatched);
                    }
                }
            }

            if mismatched.map_or(false, |m| !m.is_empty()) {
                bail!("scheduled execution changed the results");
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
