//! labelhub: host for label worker and experiment child processes, plus
//! commands that drive them from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use labelhub::{
    ActiveLearningConfig, AlBattleConfig, BattleRegistry, Dataset, FileBattleStore,
    InMemorySampleStore, ProcessExperimentSpawner, ProcessSpawner, StatusCode,
    WorkerHandleConfig, WorkerRegistry,
};

#[derive(Parser)]
#[command(name = "labelhub", version = labelhub::VERSION, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Label worker child process. Speaks frames on stdin/stdout.
    Worker,
    /// Battle experiment child process. Reads one INIT frame, streams events.
    Experiment,
    /// Runs a battle on a dataset file and prints the comparison as JSON.
    Battle {
        /// Dataset snapshot (JSON).
        #[arg(long, env = "LABELHUB_DATASET")]
        dataset: PathBuf,
        /// Battle configuration (JSON).
        #[arg(long, env = "LABELHUB_BATTLE_CONFIG")]
        config: PathBuf,
        /// Where finished battles are stored. Nothing is persisted without it.
        #[arg(long, env = "LABELHUB_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Status polling interval in milliseconds.
        #[arg(long, env = "LABELHUB_POLL_MS", default_value_t = 500)]
        poll_ms: u64,
    },
    /// Asks a label worker for the next samples to label.
    Suggest {
        /// Dataset snapshot (JSON).
        #[arg(long, env = "LABELHUB_DATASET")]
        dataset: PathBuf,
        /// Worker configuration (JSON). Defaults apply without it.
        #[arg(long, env = "LABELHUB_WORKER_CONFIG")]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// How long to wait for the worker before falling back to random.
        #[arg(long, env = "LABELHUB_RESPONSE_WAIT_MS", default_value_t = 1000)]
        response_wait_ms: u64,
    },
}

/// Initialize tracing with LABELHUB_LOG and LOG_FORMAT support. Always writes
/// to stderr: child processes reserve stdout for frames.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("LABELHUB_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("labelhub={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("malformed {}", path.display()))
}

fn load_store(path: &Path) -> anyhow::Result<(Arc<InMemorySampleStore>, Dataset)> {
    let dataset: Dataset = read_json(path)?;
    let store = Arc::new(InMemorySampleStore::new());
    store.insert(dataset.clone());
    Ok((store, dataset))
}

async fn battle(
    dataset: &Path,
    config: &Path,
    data_dir: Option<&Path>,
    poll: Duration,
) -> anyhow::Result<()> {
    let (samples, dataset) = load_store(dataset)?;
    let config: AlBattleConfig = read_json(config)?;
    let store = data_dir.map(FileBattleStore::new);

    let registry = BattleRegistry::new(samples, Arc::new(ProcessExperimentSpawner::default()));
    if let Some(store) = &store {
        registry.restore(store).await?;
    }

    let id = registry.create_and_start(dataset.id, config).await?;
    let mut last = None;
    loop {
        let status = registry.get_status(id)?;
        if last != Some(status.code) {
            tracing::info!(experiment_id = %id, code = ?status.code, "Battle status");
            last = Some(status.code);
        }
        if status.code == StatusCode::Completed {
            break;
        }
        if let Some(remaining) = status.remaining {
            tracing::debug!(experiment_id = %id, remaining_secs = remaining, "Training");
        }
        tokio::time::sleep(poll).await;
    }

    let analyzer = registry.get_or_create_finished(id)?;
    if let Some(store) = &store {
        registry.persist(id, store).await?;
    }
    println!("{}", serde_json::to_string_pretty(analyzer.metrics())?);
    Ok(())
}

async fn suggest(
    dataset: &Path,
    config: Option<&Path>,
    count: usize,
    response_wait: Duration,
) -> anyhow::Result<()> {
    let (samples, dataset) = load_store(dataset)?;
    let config: ActiveLearningConfig = match config {
        Some(path) => read_json(path)?,
        None => ActiveLearningConfig::default(),
    };

    let registry = WorkerRegistry::new(
        samples,
        WorkerHandleConfig::new()
            .with_spawner(Arc::new(ProcessSpawner::default()))
            .with_response_wait(response_wait),
    )
    .with_default_config(config);
    let handle = registry.get_or_create(dataset.id).await?;

    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(handle.get_next_sample_id().await?);
    }
    println!("{}", serde_json::to_string(&ids)?);
    registry.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Worker => labelhub::label_worker::run_stdio().await?,
        Command::Experiment => labelhub::battle::experiment::run_stdio().await?,
        Command::Battle {
            dataset,
            config,
            data_dir,
            poll_ms,
        } => {
            battle(
                &dataset,
                &config,
                data_dir.as_deref(),
                Duration::from_millis(poll_ms),
            )
            .await?
        }
        Command::Suggest {
            dataset,
            config,
            count,
            response_wait_ms,
        } => {
            suggest(
                &dataset,
                config.as_deref(),
                count,
                Duration::from_millis(response_wait_ms),
            )
            .await?
        }
    }
    Ok(())
}
