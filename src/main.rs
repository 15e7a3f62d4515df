use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use codeq::callbacks::CallbackDispatcher;
use codeq::config::CodeqConfig;
use codeq::metrics::CoreMetrics;
use codeq::notify::{Notifier, NotifierConfig};
use codeq::repo::redis::RedisRepository;
use codeq::repo::TaskRepository;
use codeq::rest;
use codeq::scheduler::SchedulerService;
use codeq::store::Store;
use codeq::subscriptions::{run_subscription_janitor, RedisSubscriptionStore};
use codeq::AppContext;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "codeq",
    about = "codeQ — persistent task scheduling and completion service",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST listen port
    #[arg(long, env = "CODEQ_PORT")]
    port: Option<u16>,

    /// Store URL (any Redis-protocol-compatible server)
    #[arg(long, env = "CODEQ_STORE_URL")]
    store_url: Option<String>,

    /// Path to codeq.toml
    #[arg(long, env = "CODEQ_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CODEQ_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "CODEQ_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the service (default when no subcommand given).
    ///
    /// Examples:
    ///   codeq serve
    ///   codeq
    Serve,
    /// Run one retention cleanup pass and exit.
    ///
    /// Same code path as POST /v1/codeq/admin/tasks/cleanup. Prints the
    /// outcome as JSON.
    ///
    /// Examples:
    ///   codeq cleanup
    ///   codeq cleanup --limit 5000
    Cleanup {
        /// Maximum records to remove in this pass
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check store connectivity and exit non-zero on failure.
    ///
    /// Examples:
    ///   codeq doctor
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Logging setup ────────────────────────────────────────────────────────
    // Init once — must happen before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let config = Arc::new(CodeqConfig::new(
        args.config.as_deref(),
        args.port,
        args.store_url,
        args.log,
    ));

    match args.command {
        Some(Command::Cleanup { limit }) => run_cleanup(config, limit).await,
        Some(Command::Doctor) => run_doctor(config).await,
        None | Some(Command::Serve) => run_server(config).await,
    }
}

async fn run_server(config: Arc<CodeqConfig>) -> Result<()> {
    let store = Store::connect(&config.store_url)
        .await
        .with_context(|| format!("cannot reach store at {}", config.store_url))?;
    info!(store_url = %config.store_url, "connected to store");

    let metrics = Arc::new(CoreMetrics::new());
    let repo = Arc::new(
        RedisRepository::new(store.clone(), config.retention_seconds)
            .with_filters(
                Arc::new(codeq::bloom::RotatingBloom::new(
                    config.bloom_capacity,
                    config.bloom_fp_rate,
                    config.bloom_rotate,
                )),
                Arc::new(codeq::bloom::RotatingBloom::new(
                    config.bloom_capacity,
                    config.bloom_fp_rate,
                    config.bloom_rotate,
                )),
            )
            .with_metrics(Arc::clone(&metrics)),
    );
    let subscriptions = Arc::new(RedisSubscriptionStore::new(store.clone()));

    let notifier = Arc::new(Notifier::new(
        subscriptions.clone(),
        NotifierConfig {
            claim_url: config.claim_url.clone(),
            secret: config.webhook_secret.clone(),
        },
        Arc::clone(&metrics),
    ));
    let callbacks = CallbackDispatcher::new(config.callback_config(), Arc::clone(&metrics));

    let scheduler = Arc::new(
        SchedulerService::new(
            repo as Arc<dyn TaskRepository>,
            config.scheduler_config(),
            Arc::clone(&metrics),
        )
        .with_notifier(notifier)
        .with_callbacks(callbacks),
    );

    tokio::spawn(run_subscription_janitor(
        subscriptions.clone(),
        config.subscription_sweep,
    ));

    let ctx = Arc::new(AppContext {
        config,
        scheduler,
        subscriptions,
        metrics,
        store: Some(store),
        started_at: std::time::Instant::now(),
    });

    rest::start_rest_server(ctx).await
}

async fn run_cleanup(config: Arc<CodeqConfig>, limit: Option<usize>) -> Result<()> {
    let store = Store::connect(&config.store_url)
        .await
        .with_context(|| format!("cannot reach store at {}", config.store_url))?;
    let metrics = Arc::new(CoreMetrics::new());
    let repo = Arc::new(RedisRepository::new(store, config.retention_seconds));
    let scheduler = SchedulerService::new(
        repo as Arc<dyn TaskRepository>,
        config.scheduler_config(),
        metrics,
    );

    let outcome = scheduler
        .cleanup_expired(limit, None)
        .await
        .context("cleanup pass failed")?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn run_doctor(config: Arc<CodeqConfig>) -> Result<()> {
    let store = match Store::connect(&config.store_url).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("FAIL store connect ({}): {e}", config.store_url);
            std::process::exit(1);
        }
    };
    if let Err(e) = store.ping().await {
        eprintln!("FAIL store ping: {e}");
        std::process::exit(1);
    }
    println!("OK   store reachable at {}", config.store_url);
    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("codeq.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
