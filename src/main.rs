//! DCA trading engine - main entry point
//!
//! The `serve` subcommand runs the engine control plane: leader election
//! over the coordination layer, then the queue manager, order fill
//! monitor, risk engine, and pool reconciler as watchdog-supervised tasks
//! on the elected leader. Followers keep campaigning and take over within
//! one lock TTL when the leader dies.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dca_engine::common::CircuitBreakerConfig;
use dca_engine::coordination::{Coordination, ServiceHealth};
use dca_engine::exchange::{ExchangeGateway, GatewayConfig};
use dca_engine::security::PlainCipher;
use dca_engine::services::watchdog::{HealthFn, StartFn};
use dca_engine::services::{
    FillMonitor, LeaderElection, PositionManager, QueueManager, RiskEngine, Watchdog,
};
use dca_engine::{Database, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "dca-engine")]
#[command(about = "Multi-user DCA spot-trading engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine control plane
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/engine.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "engine_{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Serve { config } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            runtime.block_on(serve(config))
        }
    }
}

async fn serve(config_path: String) -> Result<()> {
    let config = if std::path::Path::new(&config_path).exists() {
        EngineConfig::from_file(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        EngineConfig::default()
    };

    let db = Database::open(&config.database_path)?;
    let coordination = Arc::new(Coordination::connect(&config.redis_url).await);
    if !coordination.is_distributed() {
        warn!("running with process-local coordination; multi-replica safety is best-effort");
    }

    let gateway = Arc::new(ExchangeGateway::new(
        GatewayConfig {
            venues: config.venues.clone(),
            breaker: CircuitBreakerConfig::default(),
        },
        Arc::new(PlainCipher),
    ));

    let positions = Arc::new(PositionManager::new(
        db.clone(),
        Arc::clone(&coordination),
        Arc::clone(&gateway),
        config.estimated_exit_fee_percent,
    ));
    let pool = Arc::new(dca_engine::services::ExecutionPool::new(
        config.pool.clone(),
        db.clone(),
    ));

    let queue_manager = Arc::new(QueueManager::new(
        db.clone(),
        Arc::clone(&pool),
        Arc::clone(&positions),
        Arc::clone(&gateway),
        Arc::clone(&coordination),
    ));
    let fill_monitor = Arc::new(FillMonitor::new(
        db.clone(),
        Arc::clone(&gateway),
        Arc::clone(&positions),
        Arc::clone(&coordination),
    ));
    let risk_engine = Arc::new(RiskEngine::new(
        db.clone(),
        Arc::clone(&gateway),
        Arc::clone(&positions),
        config.max_slippage_percent,
    ));

    let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));
    register_background_tasks(
        &watchdog,
        &config,
        Arc::clone(&queue_manager),
        Arc::clone(&fill_monitor),
        Arc::clone(&risk_engine),
        Arc::clone(&pool),
        Arc::clone(&gateway),
        Arc::clone(&coordination),
    );

    let leader = Arc::new(LeaderElection::new(Arc::clone(&coordination)));

    info!("╔════════════════════════════════════════════╗");
    info!("║            DCA TRADING ENGINE              ║");
    info!("╠════════════════════════════════════════════╣");
    info!("║ Worker id: {:<31} ║", leader.worker_id());
    info!("║ Database:  {:<31} ║", config.database_path);
    info!("║ Venues:    {:<31} ║", config.venues.len());
    info!("╚════════════════════════════════════════════╝");

    let mut renewal_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut watchdog_task: Option<tokio::task::JoinHandle<()>> = None;

    if leader.try_acquire().await {
        watchdog.start_all();
        renewal_task = Some(tokio::spawn(Arc::clone(&leader).run_renewal()));
        watchdog_task = Some(tokio::spawn(Arc::clone(&watchdog).run()));
    }

    let mut supervise = tokio::time::interval(Duration::from_secs(10));
    supervise.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = supervise.tick() => {
                let renewal_alive = renewal_task
                    .as_ref()
                    .map(|t| !t.is_finished())
                    .unwrap_or(false);

                if leader.is_leader() && !renewal_alive {
                    // Freshly elected (or renewal task died): (re)start
                    renewal_task = Some(tokio::spawn(Arc::clone(&leader).run_renewal()));
                } else if !leader.is_leader() {
                    // Demoted or never elected: stop loops, keep campaigning
                    if renewal_alive {
                        warn!("demoted, stopping background loops");
                    }
                    if let Some(task) = watchdog_task.take() {
                        task.abort();
                        watchdog.stop_all();
                    }
                    if leader.try_acquire().await {
                        info!("elected leader, starting background loops");
                        watchdog.start_all();
                        renewal_task = Some(tokio::spawn(Arc::clone(&leader).run_renewal()));
                        watchdog_task = Some(tokio::spawn(Arc::clone(&watchdog).run()));
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("signal handler error: {e}");
                }
                info!("shutdown signal received");
                break;
            }
        }
    }

    if let Some(task) = renewal_task {
        task.abort();
    }
    if let Some(task) = watchdog_task {
        task.abort();
    }
    watchdog.stop_all();
    leader.resign().await;
    gateway.drain().await;
    info!("engine stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn register_background_tasks(
    watchdog: &Watchdog,
    config: &EngineConfig,
    queue_manager: Arc<QueueManager>,
    fill_monitor: Arc<FillMonitor>,
    risk_engine: Arc<RiskEngine>,
    pool: Arc<dca_engine::services::ExecutionPool>,
    gateway: Arc<ExchangeGateway>,
    coordination: Arc<Coordination>,
) {
    let queue_period = Duration::from_secs(config.intervals.queue_manager_secs);
    let monitor_period = Duration::from_secs(config.intervals.fill_monitor_secs);
    let risk_period = Duration::from_secs(config.intervals.risk_engine_secs);
    let reconcile_period = Duration::from_secs(config.intervals.pool_reconcile_secs);

    let queue_coordination = Arc::clone(&coordination);
    let queue_start: StartFn = Arc::new(move || {
        let queue_manager = Arc::clone(&queue_manager);
        let coordination = Arc::clone(&queue_coordination);
        let period = queue_period;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                if let Err(e) = queue_manager.run_cycle().await {
                    error!("queue manager cycle failed: {e}");
                }
                coordination
                    .set_service_health("queue_manager", &ServiceHealth::running())
                    .await;
            }
        })
    });
    watchdog.register_task(
        "queue_manager",
        queue_start,
        Some(health_fn(Arc::clone(&coordination), "queue_manager")),
        true,
    );

    let monitor_start: StartFn = Arc::new(move || {
        let fill_monitor = Arc::clone(&fill_monitor);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor_period);
            loop {
                tick.tick().await;
                if let Err(e) = fill_monitor.run_cycle().await {
                    error!("fill monitor cycle failed: {e}");
                }
            }
        })
    });
    watchdog.register_task(
        "order_fill_monitor",
        monitor_start,
        Some(health_fn(
            Arc::clone(&coordination),
            dca_engine::services::fill_monitor::SERVICE_NAME,
        )),
        true,
    );

    let risk_coordination = Arc::clone(&coordination);
    let risk_start: StartFn = Arc::new(move || {
        let risk_engine = Arc::clone(&risk_engine);
        let coordination = Arc::clone(&risk_coordination);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(risk_period);
            loop {
                tick.tick().await;
                if let Err(e) = risk_engine.run_cycle().await {
                    error!("risk engine cycle failed: {e}");
                }
                coordination
                    .set_service_health("risk_engine", &ServiceHealth::running())
                    .await;
            }
        })
    });
    watchdog.register_task(
        "risk_engine",
        risk_start,
        Some(health_fn(Arc::clone(&coordination), "risk_engine")),
        true,
    );

    let housekeeping_start: StartFn = Arc::new(move || {
        let pool = Arc::clone(&pool);
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(reconcile_period);
            loop {
                tick.tick().await;
                if let Err(e) = pool.reconcile() {
                    error!("pool reconcile failed: {e}");
                }
                gateway.sweep_expired().await;
            }
        })
    });
    watchdog.register_task("housekeeping", housekeeping_start, None, false);
}

fn health_fn(coordination: Arc<Coordination>, service: &'static str) -> HealthFn {
    Arc::new(move || {
        let coordination = Arc::clone(&coordination);
        Box::pin(async move { coordination.get_service_health(service).await })
    })
}
