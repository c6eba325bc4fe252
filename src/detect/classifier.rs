use super::{AnomalyClassifier, ClassifyError};
use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Client for the external scoring service (`POST {"latency_ms": n}` ->
/// `{"anomaly": 0|1}`).
pub struct HttpClassifier {
    client: Client,
    endpoint: String,
    outage: OutageTracker,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, outage_alert_after: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build classifier HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            outage: OutageTracker::new(outage_alert_after),
        })
    }

    async fn score(&self, latency_ms: u32) -> Result<bool, ClassifyError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "latency_ms": latency_ms }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClassifyError::Status(status.as_u16()));
        }

        let body: Value = resp.json().await?;
        parse_verdict(&body)
    }
}

fn parse_verdict(body: &Value) -> Result<bool, ClassifyError> {
    match body.get("anomaly") {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(ClassifyError::Malformed(format!("unexpected anomaly value {n}"))),
        },
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(ClassifyError::Malformed(format!("unexpected anomaly value {other}"))),
        None => Err(ClassifyError::Malformed("missing 'anomaly' field".to_string())),
    }
}

#[async_trait::async_trait]
impl AnomalyClassifier for HttpClassifier {
    async fn classify(&self, latency_ms: Option<u32>) -> bool {
        let Some(latency_ms) = latency_ms else {
            return false;
        };

        match self.score(latency_ms).await {
            Ok(verdict) => {
                self.outage.record_success();
                debug!(latency_ms, anomaly = verdict, "Classifier verdict");
                verdict
            }
            Err(e) => {
                self.outage.record_failure(&e);
                false
            }
        }
    }

    fn is_degraded(&self) -> bool {
        self.outage.is_degraded()
    }
}

/// Used when no classifier endpoint is configured.
pub struct DisabledClassifier;

#[async_trait::async_trait]
impl AnomalyClassifier for DisabledClassifier {
    async fn classify(&self, _latency_ms: Option<u32>) -> bool {
        false
    }
}

/// Counts consecutive failures and escalates once the configured threshold
/// is reached.
struct OutageTracker {
    alert_after: u32,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

impl OutageTracker {
    fn new(alert_after: u32) -> Self {
        Self {
            alert_after,
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    fn record_failure(&self, err: &ClassifyError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let escalate = self.alert_after > 0 && failures >= self.alert_after;
        if escalate && !self.degraded.swap(true, Ordering::Relaxed) {
            error!(
                failures,
                error = %err,
                "Anomaly classifier unavailable; outcomes are being recorded as not anomalous"
            );
            return;
        }
        warn!(failures, error = %err, "Anomaly classification failed, defaulting to not anomalous");
    }

    fn record_success(&self) {
        let failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(failures, "Anomaly classifier recovered");
        }
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}
