use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use corral_engine::http_adapter::HttpToolAdapter;
use corral_engine::{
    AdapterRegistry, BudgetLedger, EventBus, ToolInvoker, WorkflowEngine, WorkflowRegistry,
};
use corral_server::bridge::EventBridge;
use corral_server::delivery::{DeliveryConfig, DeliveryLayer};
use corral_server::gateway::LocalGateway;
use corral_server::handlers::AppState;
use corral_server::{Server, ServerConfig};
use corral_store::replay::ReplayRepo;
use corral_store::sandboxes::SandboxRepo;
use corral_store::sessions::SessionRepo;
use corral_store::usage_log::UsageLogRepo;
use corral_store::workflows::WorkflowRunRepo;
use corral_store::Database;
use corral_telemetry::{init_logging, LoggingConfig, MetricsRecorder};

const BUDGET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(&LoggingConfig::from_env());
    info!("starting corral");

    let db_path = database_path();
    let db = Database::open(&db_path).context("open database")?;

    let sandboxes = Arc::new(SandboxRepo::new(db.clone()));
    let sessions = Arc::new(SessionRepo::new(db.clone()));
    let usage_log = Arc::new(UsageLogRepo::new(db.clone()));
    let replay = Arc::new(ReplayRepo::new(db.clone()));
    let runs = Arc::new(WorkflowRunRepo::new(db));

    let ledger = Arc::new(BudgetLedger::new(Arc::clone(&sandboxes)));
    let bus = Arc::new(EventBus::new());
    let metrics = Arc::new(MetricsRecorder::new());

    let adapters = Arc::new(build_adapters());
    info!(tools = ?adapters.names(), "adapters registered");

    let invoker = Arc::new(ToolInvoker::new(
        Arc::clone(&adapters),
        Arc::clone(&ledger),
        Arc::clone(&sessions),
        Arc::clone(&replay),
        Arc::clone(&bus),
        Arc::clone(&metrics),
    ));

    let workflows = Arc::new(load_workflows()?);
    info!(workflows = ?workflows.ids(), "workflows registered");

    let workflow_engine = Arc::new(WorkflowEngine::new(
        Arc::clone(&invoker),
        workflows,
        Arc::clone(&runs),
        Arc::clone(&sessions),
        Arc::clone(&replay),
        Arc::clone(&bus),
        Arc::clone(&metrics),
    ));

    let delivery = Arc::new(DeliveryLayer::new(
        Arc::new(LocalGateway::default()),
        DeliveryConfig::default(),
    ));
    EventBridge::install(Arc::clone(&delivery), &bus);

    let shutdown = CancellationToken::new();
    let pump = delivery.start_pump(shutdown.clone());
    let reset_task = ledger.start_reset_task(BUDGET_SWEEP_INTERVAL, shutdown.clone());
    let idle_task = spawn_idle_sweep(Arc::clone(&sessions), shutdown.clone());

    let state = Arc::new(AppState {
        sandboxes,
        sessions,
        usage_log,
        replay,
        runs,
        invoker,
        workflow_engine,
        delivery,
        metrics,
    });

    let config = ServerConfig::from_env();
    let (addr, server_task) = Server::new(config, state)
        .start(shutdown.clone())
        .await
        .context("bind server")?;
    info!(addr = %addr, "corral ready");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();

    let _ = server_task.await;
    let _ = pump.await;
    let _ = reset_task.await;
    let _ = idle_task.await;
    Ok(())
}

fn database_path() -> PathBuf {
    if let Ok(path) = std::env::var("CORRAL_DB") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".corral").join("corral.db")
}

/// Tool adapters come from CORRAL_TOOLS: comma-separated `name=url`
/// pairs, each forwarded over HTTP. A trailing `!` on the name marks
/// the upstream idempotent (safe to retry).
fn build_adapters() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    let Ok(spec) = std::env::var("CORRAL_TOOLS") else {
        return registry;
    };
    for pair in spec.split(',').filter(|s| !s.trim().is_empty()) {
        let Some((name, url)) = pair.split_once('=') else {
            warn!(pair, "skipping malformed CORRAL_TOOLS entry");
            continue;
        };
        let (name, idempotent) = match name.trim().strip_suffix('!') {
            Some(stripped) => (stripped, true),
            None => (name.trim(), false),
        };
        let mut adapter = HttpToolAdapter::new(name, url.trim());
        if idempotent {
            adapter = adapter.idempotent();
        }
        if let Ok(key) = std::env::var("CORRAL_TOOL_API_KEY") {
            adapter = adapter.with_api_key(key);
        }
        registry.register(Arc::new(adapter));
    }
    registry
}

/// Workflow definitions load from the JSON file named by
/// CORRAL_WORKFLOWS: an array of definitions.
fn load_workflows() -> anyhow::Result<WorkflowRegistry> {
    let mut registry = WorkflowRegistry::new();
    let Ok(path) = std::env::var("CORRAL_WORKFLOWS") else {
        return Ok(registry);
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("read workflows file {path}"))?;
    let definitions: Vec<corral_core::workflow::WorkflowDefinition> =
        serde_json::from_str(&raw).context("parse workflows file")?;
    for definition in definitions {
        registry.register(definition);
    }
    Ok(registry)
}

fn spawn_idle_sweep(
    sessions: Arc<SessionRepo>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = chrono::Utc::now()
                        - chrono::Duration::seconds(SESSION_IDLE_TIMEOUT.as_secs() as i64);
                    if let Err(e) = sessions.end_idle(cutoff) {
                        warn!(error = %e, "idle session sweep failed");
                    }
                }
            }
        }
    })
}
