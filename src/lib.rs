//! SmartUptime -- uptime monitoring with automated remediation.
//!
//! This crate provides the core library for probing registered endpoints,
//! classifying latency anomalies, evaluating remediation rules against probe
//! history, and running remediation scripts with a persistent audit trail.

pub mod api;
pub mod config;
pub mod detect;
pub mod executor;
pub mod probes;
pub mod rules;
pub mod scheduler;
pub mod sites;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::detect::{AnomalyClassifier, DisabledClassifier, HttpClassifier};
use crate::executor::ScriptExecutor;
use crate::probes::HttpProber;
use crate::scheduler::Scheduler;
use crate::storage::{ExecutionLedger, SqliteStore};

/// Fully wired components sharing one store and one shutdown token.
pub struct App {
    pub store: Arc<SqliteStore>,
    pub classifier: Arc<dyn AnomalyClassifier>,
    pub executor: ScriptExecutor,
    pub scheduler: Scheduler,
    pub shutdown: CancellationToken,
}

impl App {
    /// Open the database (seeding default rules on first start) and build
    /// the prober, classifier, executor and scheduler.
    pub async fn open(config: &MonitorConfig) -> Result<Self> {
        let store = Arc::new(open_store(config)?);
        storage::seed_default_rules(store.as_ref()).await?;

        let stale = store.stale_executions().await?;
        for record in &stale {
            warn!(
                execution_id = record.id,
                rule_id = ?record.rule_id,
                started_at = %record.started_at,
                "Execution left running by a previous process"
            );
        }

        let classifier: Arc<dyn AnomalyClassifier> = match &config.classifier.endpoint {
            Some(endpoint) => Arc::new(HttpClassifier::new(
                endpoint.clone(),
                config.classifier.timeout(),
                config.classifier.outage_alert_after,
            )?),
            None => {
                info!("No classifier endpoint configured, anomaly classification disabled");
                Arc::new(DisabledClassifier)
            }
        };

        let shutdown = CancellationToken::new();
        let executor = ScriptExecutor::new(
            store.clone(),
            config.scripts.root.clone(),
            config.scripts.timeout(),
            shutdown.clone(),
        );
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(HttpProber::new()?),
            classifier.clone(),
            executor.clone(),
            config.scheduler.clone(),
        );

        Ok(Self {
            store,
            classifier,
            executor,
            scheduler,
            shutdown,
        })
    }
}

/// Open (creating if needed) the SQLite database named in `config`.
pub fn open_store(config: &MonitorConfig) -> Result<SqliteStore> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory: {}", parent.display()))?;
    }
    info!(db_path = %db_path.display(), "Initializing database");
    SqliteStore::open(db_path)
}

/// Start the SmartUptime daemon: API server and poll loop, until Ctrl-C.
pub async fn serve(config: MonitorConfig) -> Result<()> {
    let app = App::open(&config).await?;

    let scheduler_task = tokio::spawn(scheduler::run_scheduler_loop(
        app.scheduler.clone(),
        app.shutdown.clone(),
    ));

    let signal_token = app.shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal_token.cancel();
            }
            Err(e) => error!(error = %e, "Unable to listen for shutdown signal"),
        }
    });

    let state = api::state::AppState {
        store: app.store.clone(),
        executor: app.executor.clone(),
        classifier: app.classifier.clone(),
    };
    let router = api::router(state, config.api.cors_origin.as_deref())?;

    let addr: SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "SmartUptime listening");

    let server_token = app.shutdown.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await;

    app.shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task panicked");
    }
    app.executor.drain().await;
    info!("SmartUptime stopped");

    served.context("API server failed")
}
