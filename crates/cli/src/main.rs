use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use composite_engine::EngineConfig;
use tracing::{Level, info};

mod dependencies;
mod samples;

/// Describe, evaluate, and profile the bundled composite templates.
#[derive(Parser, Debug)]
#[command(name = "composite", version, about)]
struct Args {
    /// Log every step as it runs (overrides COMPOSITE_TRACE)
    #[arg(long, global = true)]
    trace: bool,

    /// Skip the dependency audit after first calls
    #[arg(long, global = true)]
    no_audit: bool,

    /// Evaluate cached steps every time
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the bundled samples
    List,
    /// Print the resolved shape of a sample as JSON
    Describe {
        /// Sample name
        sample: String,
    },
    /// Evaluate a sample against a dependency map
    Run {
        /// Sample name
        sample: String,

        /// JSON or YAML file holding named dependencies
        #[arg(long)]
        deps: Option<PathBuf>,

        /// Inline JSON object of dependencies, applied after --deps
        #[arg(long)]
        json: Option<String>,

        /// Transform this value instead of computing (JSON, or a plain string)
        #[arg(long)]
        value: Option<String>,

        /// Number of evaluations to run
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Print cache timings after the run
        #[arg(long)]
        report: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    config.trace_steps |= args.trace;
    config.audit_dependencies &= !args.no_audit;
    config.cache_steps &= !args.no_cache;
    config.install();

    match args.command {
        Command::List => {
            for sample in samples::catalog() {
                println!("{:<16} {}", sample.name, sample.summary);
            }
            Ok(())
        }
        Command::Describe { sample } => {
            let resolved = find_sample(&sample)?.instance()?.to_resolved_composition()?;
            println!("{}", serde_json::to_string_pretty(&resolved.shape())?);
            Ok(())
        }
        Command::Run {
            sample,
            deps,
            json,
            value,
            repeat,
            report,
        } => {
            let resolved = find_sample(&sample)?.instance()?.to_resolved_composition()?;

            let mut layers = Vec::new();
            if let Some(path) = deps {
                layers.push(dependencies::load_file(&path)?);
            }
            if let Some(text) = json {
                layers.push(dependencies::parse_inline(&text)?);
            }
            let ambient = dependencies::merge(layers);
            let value = value.as_deref().map(dependencies::parse_value);

            let mut result = serde_json::Value::Null;
            for round in 0..repeat.max(1) {
                result = match &value {
                    Some(value) => resolved.transform(value.clone(), &ambient),
                    None => resolved.compute(&ambient),
                }
                .with_context(|| format!("evaluate `{sample}` (round {})", round + 1))?;
            }
            info!(sample = %sample, rounds = repeat.max(1), "evaluation finished");
            println!("{}", serde_json::to_string_pretty(&result)?);

            if report {
                print!("{}", resolved.cache().render_report());
                resolved.cache().log_report();
            }
            Ok(())
        }
    }
}

fn find_sample(name: &str) -> Result<samples::Sample> {
    samples::find(name).with_context(|| {
        let known: Vec<&str> = samples::catalog().iter().map(|sample| sample.name).collect();
        format!("unknown sample `{name}` (known: {})", known.join(", "))
    })
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .try_init();
}
