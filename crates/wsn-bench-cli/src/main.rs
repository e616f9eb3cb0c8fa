use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use wsn_bench_abstract::{CampaignFile, CampaignPlan};
use wsn_bench_runner::{
    AggregateOptions, CampaignReport, CampaignRunner, CampaignState, HostExec, ResultStore,
    RigController, RigState, TrialExecutor, TupleSummary, aggregate,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable benchmark campaigns on a sensor-network testbed")]
struct Args {
    /// Log every command issued to the rig.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or resume) the campaign described by a TOML file.
    Run {
        #[arg(long)]
        config: PathBuf,

        #[arg(long, default_value = "benchs")]
        results_dir: PathBuf,

        /// The devices already run the first requested driver; skip the initial flash.
        #[arg(long, default_value_t = false)]
        assume_programmed: bool,
    },

    /// Summarize every result file into per-tuple statistics.
    Summarize {
        #[arg(long, default_value = "benchs")]
        results_dir: PathBuf,

        /// Write the summaries as JSON instead of printing them.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Drop simple-mode samples slower than this (0 disables the bound).
        #[arg(long)]
        max_latency_ms: Option<u64>,

        /// Convert energy-accounting ticks to seconds at this rate.
        #[arg(long)]
        ticks_per_second: Option<f64>,
    },

    /// Print the expanded parameter grid without touching the rig.
    Plan {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run {
            config,
            results_dir,
            assume_programmed,
        } => {
            let file = load_campaign(&config)?;
            let report = run_campaign(file, results_dir, assume_programmed).await?;
            let pending = report
                .tuples
                .iter()
                .filter(|t| t.samples < t.target)
                .count();
            info!(
                "{} tuple(s), {} incomplete; {}",
                report.tuples.len(),
                pending,
                report.counters
            );
        }
        Command::Summarize {
            results_dir,
            out,
            max_latency_ms,
            ticks_per_second,
        } => {
            let mut options = AggregateOptions::default();
            if let Some(max) = max_latency_ms {
                options.max_latency_ms = (max > 0).then_some(max);
            }
            options.energy.ticks_per_second = ticks_per_second;
            let store = ResultStore::create(&results_dir)
                .with_context(|| format!("Failed to open results in {}", results_dir.display()))?;
            let summaries: Vec<TupleSummary> = aggregate(&store, &options)
                .context("Failed to aggregate results")?
                .into_values()
                .collect();
            write_summaries(out.as_deref(), &summaries)?;
        }
        Command::Plan { config } => {
            let file = load_campaign(&config)?;
            let plan = file.plan()?;
            for experiment in &plan.experiments {
                println!(
                    "# {} ({} iteration(s){})",
                    experiment.name,
                    experiment.iterations,
                    if experiment.interleave { ", interleaved" } else { "" }
                );
                for tuple in &experiment.tuples {
                    println!("{}\t{}", tuple, tuple.file_name());
                }
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn load_campaign(path: &Path) -> Result<CampaignFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read campaign file {}", path.display()))?;
    let file: CampaignFile = toml::from_str(&content).context("Failed to parse campaign file")?;
    Ok(file)
}

fn check_rig_size(plan: &CampaignPlan, device_count: u32) -> Result<()> {
    let needed = plan.max_hops() + 1;
    if needed > device_count {
        anyhow::bail!(
            "plan needs {} devices (gateway + {} hops) but the rig has {}",
            needed,
            plan.max_hops(),
            device_count
        );
    }
    Ok(())
}

async fn run_campaign(
    file: CampaignFile,
    results_dir: PathBuf,
    assume_programmed: bool,
) -> Result<CampaignReport> {
    let plan = file.plan()?;
    let policy = file.policy()?;
    let rig_config = file.rig_config();
    check_rig_size(&plan, rig_config.device_count)?;

    let rig_state = match (assume_programmed, plan.first_rdc()) {
        (true, Some(rdc)) => {
            info!("Assuming devices already run {}", rdc);
            RigState::assume_programmed(rdc)
        }
        _ => RigState::needs_everything(),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping the rig");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let trial_config = file.trial_config();
    let report = tokio::task::spawn_blocking(move || -> Result<CampaignReport> {
        let store = ResultStore::create(&results_dir).with_context(|| {
            format!("Failed to create results directory {}", results_dir.display())
        })?;
        let mut exec = HostExec::new(&results_dir, Arc::clone(&shutdown));
        let mut runner = CampaignRunner::new(
            RigController::new(rig_config),
            TrialExecutor::new(trial_config),
            store,
            policy,
            shutdown,
        );
        let mut state = CampaignState::new(rig_state);
        let report = runner.run_plan(&mut exec, &mut state, &plan)?;
        Ok(report)
    })
    .await
    .context("Campaign task failed")??;

    Ok(report)
}

fn write_summaries(out: Option<&Path>, summaries: &[TupleSummary]) -> Result<()> {
    for summary in summaries {
        if summary.latency.high_dispersion() {
            warn!("{}: latency dispersion is high", summary.tuple);
        }
    }
    let data =
        serde_json::to_vec_pretty(summaries).context("Failed to serialize summaries")?;
    match out {
        Some(path) => {
            fs::write(path, &data)
                .with_context(|| format!("Failed to write summaries to {}", path.display()))?;
            info!("Wrote {} summaries to {}", summaries.len(), path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&data)),
    }
    Ok(())
}
