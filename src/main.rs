//! hubnity-tracker headless agent.

use clap::Parser;
use hubnity_tracker::auth::AuthManager;
use hubnity_tracker::bridge::HostBridge;
use hubnity_tracker::models::TaskSummary;
use hubnity_tracker::monitor::ActivityMonitor;
use hubnity_tracker::{init_logging, EngineConfig, EngineError, HttpApi, SyncEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "hubnity-tracker",
    version = env!("CARGO_PKG_VERSION"),
    about = "Offline-first time tracking agent: timers, evidence capture and queued sync",
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (defaults are used when missing)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long = "api-url")]
    api_url: Option<String>,

    /// Bearer token (falls back to HUBNITY_TOKEN)
    #[arg(long = "token")]
    token: Option<String>,

    /// Start a timer on launch, as TASK_ID:SUBTASK_ID (repeatable)
    #[arg(long = "track", value_name = "TASK:SUBTASK")]
    track: Vec<String>,
}

fn make_bridge(monitor: Arc<ActivityMonitor>) -> Arc<dyn HostBridge> {
    #[cfg(feature = "desktop")]
    {
        Arc::new(hubnity_tracker::capture::DesktopBridge::new(monitor, None))
    }
    #[cfg(not(feature = "desktop"))]
    {
        Arc::new(hubnity_tracker::monitor::HeadlessBridge::new(monitor, None))
    }
}

fn start_tracked(engine: &SyncEngine, tasks: &[TaskSummary], targets: &[String]) {
    for target in targets {
        let Some((task_id, sub_task_id)) = target.split_once(':') else {
            warn!("[MAIN] Ignoring --track {}: expected TASK:SUBTASK", target);
            continue;
        };
        let found = tasks.iter().find(|t| t.task.id == task_id).and_then(|t| {
            t.sub_tasks
                .iter()
                .find(|s| s.id == sub_task_id)
                .map(|s| (&t.task, s))
        });
        match found {
            Some((task, sub_task)) => match engine.start_timer(task, sub_task) {
                Ok(outcome) => info!("[MAIN] {}: {:?}", target, outcome),
                Err(e) => warn!("[MAIN] Cannot start {}: {}", target, e),
            },
            None => warn!("[MAIN] {} not found in task list", target),
        }
    }
}

async fn run(cli: Cli) -> Result<(), EngineError> {
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    init_logging(&config.log_level);

    let auth = AuthManager::new();
    auth.set_token(cli.token.or_else(|| std::env::var("HUBNITY_TOKEN").ok()))
        .await;

    let api = Arc::new(HttpApi::new(&config, auth.clone()));
    let monitor = Arc::new(ActivityMonitor::new());
    let engine = SyncEngine::open(config, api, make_bridge(monitor), Some(auth))?;

    if !cli.track.is_empty() {
        let tasks = engine.load_tasks().await;
        start_tracked(&engine, &tasks, &cli.track);
    }

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("[MAIN] Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await;

    let stopped = engine.stop_all()?;
    info!("[MAIN] Shutdown: {} timer(s) stopped", stopped.len());
    if let Some(drain) = engine.request_drain() {
        if let Ok(Ok(report)) = drain.await {
            info!("[MAIN] Final drain: {:?}", report);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
