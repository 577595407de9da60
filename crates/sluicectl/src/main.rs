use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sluice_core::{Admission, LimiterConfig, Unlimited, WindowKind, WindowLimiter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sluicectl", version, about = "Inspect and exercise window limiters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML limiter config; flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    limit: Option<f64>,

    /// Window length in seconds.
    #[arg(long, global = true)]
    window: Option<f64>,

    /// "fixed" or "sliding".
    #[arg(long, global = true)]
    kind: Option<String>,

    #[arg(long, global = true)]
    no_burst: bool,

    #[arg(long, global = true)]
    no_release: bool,

    #[arg(long, global = true)]
    min_limit: Option<f64>,

    #[arg(long, global = true)]
    max_limit: Option<f64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show how the limit and window are normalized.
    Normalize,
    /// Validate the configuration.
    Check,
    /// Write the configuration to a TOML file.
    Init {
        #[arg(long)]
        out: PathBuf,
    },
    /// Push a batch of tasks through a limiter and report admission times.
    Simulate {
        #[arg(long, default_value_t = 10)]
        tasks: usize,

        /// How long each task holds its admission.
        #[arg(long, default_value_t = 0)]
        work_ms: u64,

        #[arg(long)]
        json: bool,

        /// Compare against admitting everything immediately.
        #[arg(long)]
        unlimited: bool,
    },
}

#[derive(Debug, Serialize)]
struct Admitted {
    task: usize,
    at_ms: f64,
    in_flight: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    match &cli.command {
        Commands::Normalize => normalize(config)?,
        Commands::Check => {
            let limiter = WindowLimiter::new(config)?;
            println!(
                "ok kind={} limit={} window={}s",
                limiter.kind(),
                limiter.limit(),
                limiter.window().as_secs_f64()
            );
        }
        Commands::Init { out } => init(&config, out)?,
        Commands::Simulate {
            tasks,
            work_ms,
            json,
            unlimited,
        } => simulate(config, *tasks, Duration::from_millis(*work_ms), *json, *unlimited).await?,
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<LimiterConfig> {
    let mut config = match &cli.config {
        Some(path) => LimiterConfig::load(path)?,
        None => LimiterConfig::default(),
    };
    if let Some(limit) = cli.limit {
        config.limit = limit;
    }
    if let Some(window) = cli.window {
        config.window = window;
    }
    if let Some(kind) = &cli.kind {
        config.kind = kind.parse::<WindowKind>()?;
    }
    if let Some(min) = cli.min_limit {
        config.min_limit = min;
    }
    if let Some(max) = cli.max_limit {
        config.max_limit = max;
    }
    if cli.no_burst {
        config.burstable = false;
    }
    if cli.no_release {
        config.release_required = false;
    }
    config.validate()?;
    Ok(config)
}

fn normalize(config: LimiterConfig) -> Result<()> {
    let (configured_limit, configured_window) = (config.limit, config.window);
    let limiter = WindowLimiter::new(config)?;
    let window = limiter.window().as_secs_f64();
    println!("configured limit={configured_limit} window={configured_window}s");
    println!("effective limit={} window={window}s", limiter.limit());
    println!("rate {}/s", limiter.limit() / window);
    Ok(())
}

fn init(config: &LimiterConfig, out: &Path) -> Result<()> {
    config
        .save(out)
        .with_context(|| format!("write {}", out.display()))?;
    println!("wrote {}", out.display());
    Ok(())
}

async fn simulate(
    config: LimiterConfig,
    tasks: usize,
    work: Duration,
    json: bool,
    unlimited: bool,
) -> Result<()> {
    let summary = format!(
        "kind={} limit={} window={}s burstable={} release_required={}",
        config.kind, config.limit, config.window, config.burstable, config.release_required
    );
    let admission: Arc<dyn Admission> = if unlimited {
        Arc::new(Unlimited::new())
    } else {
        Arc::new(WindowLimiter::new(config)?)
    };
    if !json {
        println!(
            "started {} {} tasks={tasks} unlimited={unlimited}",
            Local::now().format("%H:%M:%S"),
            summary
        );
    }

    let start = Instant::now();
    let (tx, mut rx) = mpsc::unbounded_channel::<Admitted>();
    for task in 0..tasks {
        let admission = admission.clone();
        let tx = tx.clone();
        tokio::spawn(run_task(admission, task, start, work, tx));
    }
    drop(tx);

    let mut admitted = Vec::with_capacity(tasks);
    while let Some(entry) = rx.recv().await {
        admitted.push(entry);
    }
    admitted.sort_by(|a, b| a.at_ms.total_cmp(&b.at_ms));

    for entry in &admitted {
        if json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!(
                "task={} admitted_at={:.3}s in_flight={}",
                entry.task,
                entry.at_ms / 1000.0,
                entry.in_flight
            );
        }
    }
    let total = admitted.last().map_or(0.0, |entry| entry.at_ms / 1000.0);
    info!(tasks = admitted.len(), total_secs = total, "simulation finished");
    if !json {
        println!("admitted {} tasks in {:.3}s", admitted.len(), total);
    }
    Ok(())
}

async fn run_task(
    admission: Arc<dyn Admission>,
    task: usize,
    start: Instant,
    work: Duration,
    tx: mpsc::UnboundedSender<Admitted>,
) {
    admission.acquire().await;
    let admitted = Admitted {
        task,
        at_ms: start.elapsed().as_secs_f64() * 1000.0,
        in_flight: admission.in_flight(),
    };
    if tx.send(admitted).is_err() {
        admission.release();
        return;
    }
    tokio::time::sleep(work).await;
    admission.release();
}
