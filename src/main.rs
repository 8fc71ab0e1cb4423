use clap::{Parser, Subcommand};
use signaltrader::exchange::GatewayRegistry;
use signaltrader::execution::{ExecutorConfig, OrderExecutor, TrailingStopMonitor};
use signaltrader::health::HealthReporter;
use signaltrader::ledger::PositionLedger;
use signaltrader::notify::NotificationDispatcher;
use signaltrader::queue::{worker_loop, JobQueue, DEFAULT_QUEUE_KEY};
use signaltrader::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

const TRAILING_SCAN_SECS: u64 = 30;
const HEALTH_INTERVAL_SECS: u64 = 300;
const CLOSE_DISPATCH_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "signaltrader", about = "Signal-to-order execution and position-lifecycle engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run job workers, trailing-stop monitor and health reporter (default)
    Run,
    /// Run only the job workers
    Worker,
    /// Run a single trailing-stop scan and exit
    Monitor,
    /// Run a single health check and exit
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/signaltrader".to_string());
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let notifier_url = std::env::var("NOTIFIER_URL").ok();

    let ledger = Arc::new(PositionLedger::connect(&database_url).await?);
    let registry = Arc::new(GatewayRegistry::with_defaults());
    let notifier = NotificationDispatcher::new(notifier_url);
    let executor = Arc::new(OrderExecutor::new(
        ledger.clone(),
        registry.clone(),
        notifier,
        ExecutorConfig::default(),
    ));

    match command {
        Command::Monitor => run_monitor_once(ledger, registry, executor).await,
        Command::Health => {
            let report = HealthReporter::new(ledger).report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Worker => {
            let queue = Arc::new(JobQueue::new(&redis_url, DEFAULT_QUEUE_KEY).await?);
            let (_close_tx, close_rx) = mpsc::channel(CLOSE_DISPATCH_BUFFER);
            tracing::info!("🚀 SignalTrader worker starting");
            worker_loop(queue, executor, close_rx).await;
            Ok(())
        }
        Command::Run => run_all(ledger, registry, executor, &redis_url).await,
    }
}

/// Full runtime: workers + trailing monitor + health reporter.
async fn run_all(
    ledger: Arc<PositionLedger>,
    registry: Arc<GatewayRegistry>,
    executor: Arc<OrderExecutor>,
    redis_url: &str,
) -> Result<()> {
    tracing::info!("🚀 SignalTrader starting - Multi-Loop Architecture");

    let queue = Arc::new(JobQueue::new(redis_url, DEFAULT_QUEUE_KEY).await?);
    let (close_tx, close_rx) = mpsc::channel(CLOSE_DISPATCH_BUFFER);

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Trailing scan: every {TRAILING_SCAN_SECS}s");
    tracing::info!("  Health check: every {HEALTH_INTERVAL_SECS}s");

    tracing::info!("\n🔄 Spawning independent loops...");

    // Loop 1: job workers (execution + monitor-dispatched closes)
    let worker_task = {
        let queue = queue.clone();
        let executor = executor.clone();
        tokio::spawn(async move {
            worker_loop(queue, executor, close_rx).await;
        })
    };

    // Loop 2: trailing-stop monitor (every 30 seconds)
    let monitor_task = {
        let monitor = TrailingStopMonitor::new(ledger.clone(), registry.clone(), close_tx);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(TRAILING_SCAN_SECS));
            loop {
                ticker.tick().await;
                let report = monitor.scan().await;
                tracing::debug!(
                    "Trailing scan: {} ({} users)",
                    report.status,
                    report.users_monitored
                );
            }
        })
    };

    // Loop 3: health reporter (every 5 minutes)
    let health_task = {
        let reporter = HealthReporter::new(ledger.clone());
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(HEALTH_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                reporter.report().await;
            }
        })
    };

    tracing::info!("✅ All loops spawned successfully");
    tracing::info!("\nPress Ctrl+C to stop...\n");

    // Wait for Ctrl+C or task failure
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = worker_task => {
            tracing::error!("Worker loop exited: {:?}", result);
        }
        result = monitor_task => {
            tracing::error!("Trailing monitor loop exited: {:?}", result);
        }
        result = health_task => {
            tracing::error!("Health loop exited: {:?}", result);
        }
    }

    tracing::info!("👋 SignalTrader stopped");
    Ok(())
}

/// One-shot scan for cron-style deployments: run the pass, then drain any
/// closes the monitor dispatched.
async fn run_monitor_once(
    ledger: Arc<PositionLedger>,
    registry: Arc<GatewayRegistry>,
    executor: Arc<OrderExecutor>,
) -> Result<()> {
    let (close_tx, mut close_rx) = mpsc::channel(CLOSE_DISPATCH_BUFFER);
    let monitor = TrailingStopMonitor::new(ledger, registry, close_tx);

    let report = monitor.scan().await;
    tracing::info!(
        "Trailing scan complete: {} ({} users monitored)",
        report.status,
        report.users_monitored
    );

    while let Ok(dispatch) = close_rx.try_recv() {
        let close = executor
            .close_position(dispatch.user_id, &dispatch.symbol, &dispatch.exchange)
            .await;
        tracing::info!("Close for {}: {}", dispatch.symbol, close.message);
    }

    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signaltrader=info".into()),
        )
        .init();
}
