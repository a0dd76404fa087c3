//! pipelower command line interface
//!
//! Usage:
//!   pipelower [OPTIONS] <input-file>
//!   pipelower --help
//!
//! Examples:
//!   pipelower blur.json                          # Print the lowered statement
//!   pipelower --emit=loop-nest blur.json         # Loop structure only
//!   pipelower --target=cuda --emit=json blur.json
//!   pipelower --run blur.json                    # Lower, execute, print outputs

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use pipelower::interp::{run_pipeline, Buffer};
use pipelower::ir::{OutputRequest, StageGraph, Target};
use pipelower::transform::{LowerConfig, LoweredPipeline};
use pipelower::utils::errors::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// pipelower - lower scheduled stage pipelines to loop nests
#[derive(Parser, Debug)]
#[command(name = "pipelower")]
#[command(version)]
#[command(about = "Lower scheduled stage pipelines to imperative loop nests", long_about = None)]
struct Cli {
    /// Pipeline file (JSON)
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Output file (defaults to stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Target: host, host-no-simd, cuda or opencl, with an optional -debug suffix
    #[arg(short, long, default_value = "host")]
    target: String,

    /// What to emit
    #[arg(long, default_value = "stmt")]
    emit: EmitKind,

    /// Treat vectorized loops as serial
    #[arg(long)]
    no_vectorize: bool,

    /// Disable sliding window
    #[arg(long)]
    no_sliding_window: bool,

    /// Disable automatic storage folding
    #[arg(long)]
    no_storage_folding: bool,

    /// Execute the lowered pipeline on the file's inputs and print the outputs
    #[arg(long)]
    run: bool,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress warnings)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmitKind {
    /// Lowered statement tree
    Stmt,
    /// Loops and produce/consume nodes only
    LoopNest,
    /// Inferred region of every stage
    Regions,
    /// The lowered pipeline as JSON
    Json,
}

/// On-disk pipeline description.
#[derive(Debug, Serialize, Deserialize)]
struct PipelineFile {
    name: String,
    graph: StageGraph,
    outputs: Vec<OutputRequest>,
    /// Input buffers, used by `--run`
    #[serde(default)]
    inputs: BTreeMap<String, Buffer>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    info!("pipelower v{}", pipelower::VERSION);
    debug!("Input file: {:?}", cli.input);

    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("Failed to read input file: {:?}", cli.input))?;
    let file: PipelineFile = serde_json::from_str(&source)
        .with_context(|| format!("Failed to parse pipeline file: {:?}", cli.input))?;

    let config = build_config(&cli)?;
    debug!("Lowering config: {:?}", config);

    let lowered = match pipelower::lower(&file.name, &file.graph, &file.outputs, &config) {
        Ok(p) => p,
        Err(e) => {
            error!("Lowering failed: {}", e);
            eprint!("{}", Diagnostic::from(&e));
            return Err(e).with_context(|| format!("Failed to lower pipeline `{}`", file.name));
        }
    };
    info!("Lowering complete!");

    if cli.run {
        let (outputs, stats) = run_pipeline(&lowered, &file.inputs)
            .with_context(|| format!("Failed to execute pipeline `{}`", file.name))?;
        info!("{} store(s) in {} loop iteration(s)", stats.total_stores(), stats.iterations);
        let text = serde_json::to_string_pretty(&outputs)?;
        return write_output(&cli.output, &text);
    }

    let text = emit(&lowered, cli.emit)?;
    write_output(&cli.output, &text)
}

fn build_config(cli: &Cli) -> Result<LowerConfig> {
    let Some(target) = Target::from_name(&cli.target) else {
        bail!("Unknown target `{}`", cli.target);
    };
    let mut config = LowerConfig::for_target(target);
    if cli.no_vectorize {
        config.no_vectorize = true;
    }
    if cli.no_sliding_window {
        config.enable_sliding_window = false;
    }
    if cli.no_storage_folding {
        config.enable_storage_folding = false;
    }
    Ok(config)
}

fn emit(lowered: &LoweredPipeline, kind: EmitKind) -> Result<String> {
    Ok(match kind {
        EmitKind::Stmt => lowered.body.to_string(),
        EmitKind::LoopNest => pipelower::print_loop_nest(&lowered.body),
        EmitKind::Regions => {
            let mut out = String::new();
            for stage in &lowered.order {
                let Some(region) = lowered.regions.get(stage) else {
                    continue;
                };
                let dims: Vec<String> = region.iter().map(|i| i.to_string()).collect();
                out.push_str(&format!("{}: {}\n", stage, dims.join(" x ")));
            }
            out
        }
        EmitKind::Json => serde_json::to_string_pretty(lowered)?,
    })
}

fn write_output(path: &Option<PathBuf>, content: &str) -> Result<()> {
    match path {
        Some(p) => {
            fs::write(p, content)
                .with_context(|| format!("Failed to write output file: {:?}", p))?;
        }
        None => {
            println!("{}", content);
        }
    }
    Ok(())
}
