use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use covcap::synthetic::self_check;
use covcap::{create_timestamped_output_dir, run_sweep_into_dir, BenchConfig};

#[derive(Debug, Parser)]
#[command(name = "covcap-sweep")]
#[command(about = "Measure covert channel capacity over a sweep of operating points")]
struct Cli {
    /// TOML configuration; `covcap.toml` in the working directory is used if present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory that relative binary, scratch and result paths resolve against
    #[arg(long)]
    base_dir: Option<PathBuf>,

    #[arg(long, default_value = "output-covcap")]
    outdir: PathBuf,

    #[arg(long)]
    runs: Option<usize>,

    #[arg(long)]
    cool_down_ms: Option<u64>,

    #[arg(long)]
    receiver_timeout_ms: Option<u64>,

    /// Run the binaries directly instead of through the affinity launcher
    #[arg(long, default_value_t = false)]
    no_pin: bool,

    /// Estimate synthetic binary symmetric channels instead of running trials
    #[arg(long, default_value_t = false)]
    self_check: bool,

    /// Raise the default log level to debug
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(cli: &Cli) -> Result<BenchConfig> {
    let mut config = BenchConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load config {}", path.display()),
        None => "failed to load config".to_string(),
    })?;

    if let Some(base) = &cli.base_dir {
        config = config.rebased(base);
    }
    if let Some(runs) = cli.runs {
        config.runs_per_key = runs;
    }
    if let Some(cool_down_ms) = cli.cool_down_ms {
        config.cool_down_ms = cool_down_ms;
    }
    if let Some(timeout_ms) = cli.receiver_timeout_ms {
        config.receiver_timeout_ms = timeout_ms;
    }
    if cli.no_pin {
        config.affinity_program = None;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run_self_check(config: &BenchConfig) -> Result<()> {
    let rows = self_check(
        &config.capacity_estimator(),
        100_000,
        0x5EED,
        &[0.0, 0.01, 0.05, 0.1, 0.2, 0.3, 0.5],
    )
    .context("synthetic self-check failed")?;

    println!("crossover  estimated     expected      abs_error     iterations");
    for row in &rows {
        println!(
            "{:<10.3} {:<13.8} {:<13.8} {:<13.3e} {}",
            row.crossover,
            row.estimated,
            row.expected,
            row.abs_error(),
            row.iterations
        );
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    if cli.self_check {
        return run_self_check(&config);
    }

    let output_dir = create_timestamped_output_dir(&cli.outdir)
        .with_context(|| format!("failed to create output dir under {}", cli.outdir.display()))?;
    let result = run_sweep_into_dir(&config, &output_dir).await?;

    for report in &result.reports {
        println!(
            "{}  {:<10} capacity={:.6} bandwidth={:.3} bit/s",
            report.key,
            report.outcome.label(),
            report.max_capacity.unwrap_or(0.0),
            report.effective_bandwidth
        );
    }
    if let Some(best) = result.best() {
        println!("best: {} at {:.3} bit/s", best.key, best.effective_bandwidth);
    }
    println!("Output directory: {}", result.output_dir.display());
    Ok(())
}
