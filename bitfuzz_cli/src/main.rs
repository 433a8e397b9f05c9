use bitfuzz_core::config::BitfuzzConfig;
use bitfuzz_core::fuzzer::Fuzzer;

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Mutation fuzzer for applications that take a single input file argument.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Application under test, invoked as `<target> <working file>`.
    #[clap(short, long)]
    target: Option<PathBuf>,
    /// Seed file to derive test cases from. May be repeated.
    #[clap(short, long = "seed")]
    seeds: Vec<PathBuf>,
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Number of test cases to run; 0 runs until killed.
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    max_bits: Option<u32>,
    #[clap(long)]
    log_file: Option<PathBuf>,
    #[clap(long)]
    crash_dir: Option<PathBuf>,
    #[clap(long)]
    rng_seed: Option<u64>,
    #[clap(short, long)]
    verbose: bool,
}

fn load_config(config_file: Option<&PathBuf>) -> Result<BitfuzzConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            BitfuzzConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                BitfuzzConfig::load_from_file(&default_config_path)
            } else {
                info!(
                    "No config file specified and 'config.toml' not found, using built-in defaults."
                );
                Ok(BitfuzzConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut BitfuzzConfig, cli: Cli) {
    if let Some(target) = cli.target {
        config.target.application = target;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.target.timeout_ms = timeout_ms;
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_executions = iterations;
    }
    if let Some(max_bits) = cli.max_bits {
        config.fuzzer.max_bits_to_flip = max_bits;
    }
    if cli.rng_seed.is_some() {
        config.fuzzer.rng_seed = cli.rng_seed;
    }
    if let Some(log_file) = cli.log_file {
        config.recorder.log_path = log_file;
    }
    if cli.crash_dir.is_some() {
        config.recorder.crash_dir = cli.crash_dir;
    }
    config.corpus.seed_paths.extend(cli.seeds);
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = load_config(cli.config_file.as_ref())?;
    apply_overrides(&mut config, cli);
    config.validate()?;

    if config.corpus.seed_paths.is_empty() {
        warn!("No seed files registered; pass --seed or set corpus.seed-paths.");
    }
    info!("Effective configuration: {config:#?}");

    let mut fuzzer = Fuzzer::from_config(&config);
    let limit = match config.fuzzer.max_executions {
        0 => "unbounded".to_string(),
        n => n.to_string(),
    };
    info!(
        "Starting fuzz loop ({} test cases) over {} seed files against {:?}...",
        limit,
        config.corpus.seed_paths.len(),
        config.target.application
    );

    let start_time = Instant::now();
    let summary = fuzzer.run()?;
    let elapsed_total = start_time.elapsed();

    info!("Fuzz loop finished in {elapsed_total:.2?}.");
    info!(
        "Tests: {}, Executions: {}, Crashes: {}, Timeouts: {}, Launch failures: {}, Skipped: {}",
        summary.tests,
        summary.executions,
        summary.crashes,
        summary.timeouts,
        summary.launch_failures,
        summary.skipped
    );
    if summary.crashes > 0 {
        info!("Crash details written to {:?}", fuzzer.recorder().log_path());
    }

    Ok(())
}
