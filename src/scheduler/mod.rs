//! Poll cycle orchestration.
//!
//! One cycle snapshots the active sites, probes them with bounded
//! parallelism, persists every outcome, evaluates rules against the freshly
//! written history and finally prunes outcomes past the retention window.

pub mod engine;
pub mod retention;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::detect::AnomalyClassifier;
use crate::executor::record::TriggerContext;
use crate::executor::ScriptExecutor;
use crate::probes::{NewOutcome, ProbeFailure, ProbeOutcome, ProbeReading, Prober};
use crate::rules::{OutcomeClass, RuleEvaluator};
use crate::sites::MonitoredSite;
use crate::storage::{ProbeLedger, RuleStore, SiteRegistry, StorageError, Store};

pub use self::engine::run_scheduler_loop;

/// Slack on top of the probe timeout before the cycle gives up on a prober.
const PROBE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("cycle cancelled")]
    Cancelled,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub sites: usize,
    /// Outcomes written this cycle, in probe completion order.
    pub outcomes: Vec<ProbeOutcome>,
    pub persist_failures: usize,
    pub spawned: usize,
    pub pruned: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    sites: Arc<dyn SiteRegistry>,
    ledger: Arc<dyn ProbeLedger>,
    rules: Arc<dyn RuleStore>,
    evaluator: RuleEvaluator,
    prober: Arc<dyn Prober>,
    classifier: Arc<dyn AnomalyClassifier>,
    executor: ScriptExecutor,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        prober: Arc<dyn Prober>,
        classifier: Arc<dyn AnomalyClassifier>,
        executor: ScriptExecutor,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            sites: store.clone(),
            ledger: store.clone(),
            evaluator: RuleEvaluator::new(store.clone()),
            rules: store,
            prober,
            classifier,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn executor(&self) -> &ScriptExecutor {
        &self.executor
    }

    /// Run one full cycle. Cancellation aborts in-flight probes and
    /// surfaces as [`CycleError::Cancelled`].
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let cycle_id = Uuid::new_v4();
        self.cycle(cycle_id, cancel)
            .instrument(info_span!("cycle", cycle = %cycle_id))
            .await
    }

    async fn cycle(&self, cycle_id: Uuid, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let sites = self.sites.list_active_sites().await?;
        debug!(sites = sites.len(), "Cycle started");

        let readings = tokio::select! {
            readings = self.probe_all(&sites) => readings,
            _ = cancel.cancelled() => return Err(CycleError::Cancelled),
        };

        let mut outcomes = Vec::with_capacity(readings.len());
        let mut persist_failures = 0;
        for new in readings {
            let site_id = new.site_id;
            match self.ledger.append(new).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_not_found() => {
                    warn!(site_id, "Site removed during cycle; outcome dropped");
                }
                Err(e) => {
                    persist_failures += 1;
                    error!(site_id, error = %e, "Failed to persist probe outcome");
                }
            }
        }

        let spawned = if outcomes.is_empty() {
            0
        } else {
            self.evaluate(&outcomes).await?
        };

        let pruned = retention::sweep(self.ledger.as_ref(), Utc::now(), self.config.retention()).await?;

        Ok(CycleReport {
            cycle_id,
            sites: sites.len(),
            outcomes,
            persist_failures,
            spawned,
            pruned,
        })
    }

    async fn probe_all(&self, sites: &[MonitoredSite]) -> Vec<NewOutcome> {
        let limit = self.config.max_concurrent_probes.max(1);
        stream::iter(sites.to_vec())
            .map(|site| {
                let this = self.clone();
                async move { this.probe_site(&site).await }
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    async fn probe_site(&self, site: &MonitoredSite) -> NewOutcome {
        let timeout = self.config.probe_timeout();
        let started = Utc::now();
        let deadline = timeout.saturating_add(PROBE_GRACE);
        let reading = match tokio::time::timeout(deadline, self.prober.probe(&site.url, timeout)).await {
            Ok(reading) => reading,
            Err(_) => ProbeReading::failed(started, ProbeFailure::Timeout),
        };

        let is_anomaly = if reading.is_network_failure() {
            true
        } else {
            self.classifier.classify(reading.latency_ms).await
        };

        match &reading.failure {
            Some(failure) => warn!(site_id = site.id, site = %site.label(), %failure, "Probe failed"),
            None => debug!(
                site_id = site.id,
                status = reading.status_code,
                latency_ms = ?reading.latency_ms,
                is_anomaly,
                "Probe finished"
            ),
        }

        NewOutcome::from_reading(site.id, reading, is_anomaly)
    }

    /// Spawn every rule that fires for this cycle's outcomes.
    async fn evaluate(&self, outcomes: &[ProbeOutcome]) -> Result<usize, CycleError> {
        let rules = self.rules.list_active_rules().await?;
        if rules.is_empty() {
            return Ok(0);
        }

        let mut spawned = 0;
        for outcome in outcomes {
            let Some(trigger) = OutcomeClass::of(outcome).trigger_type() else {
                continue;
            };
            for rule in self.evaluator.triggered(outcome, &rules).await {
                info!(rule_id = rule.id, site_id = outcome.site_id, %trigger, "Rule triggered");
                let ctx = TriggerContext::automatic(trigger, outcome.site_id, outcome.id);
                if self.executor.spawn(rule.clone(), ctx) {
                    spawned += 1;
                }
            }
        }
        Ok(spawned)
    }
}
