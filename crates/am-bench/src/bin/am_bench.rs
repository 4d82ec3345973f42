use am_bench::{ExperimentConfig, RunContext, RunOutcome};
use am_optimizer::worker::{is_worker_invocation, serve_stdio};
use am_types::MetricDefinition;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Names an experiment config file when no path argument is given.
const CONFIG_ENV: &str = "AM_BENCH_CONFIG";
/// `debugging` selects the debugging preset when no config file is given.
const PRESET_ENV: &str = "AM_BENCH_PRESET";

fn main() -> anyhow::Result<()> {
    // stdout carries the worker protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if is_worker_invocation() {
        serve_stdio(am_pipeline::lookup, MetricDefinition::builtin)?;
        return Ok(());
    }
    drive()
}

fn load_config() -> anyhow::Result<ExperimentConfig> {
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV));
    if let Some(path) = path {
        info!(path = %path.to_string_lossy(), "Loading experiment config");
        return Ok(ExperimentConfig::from_file(path)?);
    }
    match std::env::var(PRESET_ENV).as_deref() {
        Ok("debugging") => Ok(ExperimentConfig::debugging()),
        Ok(other) => anyhow::bail!("unknown preset {other}"),
        Err(_) => Ok(ExperimentConfig::default()),
    }
}

#[tokio::main]
async fn drive() -> anyhow::Result<()> {
    let config = load_config()?;
    let context = RunContext::new(config)?;

    let abort = context.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting experiment");
            abort.trigger();
        }
    });

    let summaries = tokio::task::spawn_blocking(move || context.run()).await??;

    let skipped = summaries
        .iter()
        .filter(|s| matches!(s.outcome, RunOutcome::Skipped { .. }))
        .count();
    for summary in &summaries {
        if let RunOutcome::Finished {
            state,
            trials,
            completed,
            best_score,
            ..
        } = &summary.outcome
        {
            info!(
                dataset = %summary.dataset,
                method = %summary.method,
                fold = summary.fold,
                state = ?state,
                trials,
                completed,
                best = ?best_score,
                "Run summary"
            );
        }
    }
    info!(runs = summaries.len(), skipped, "Experiment finished");
    Ok(())
}
