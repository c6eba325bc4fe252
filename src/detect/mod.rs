//! Latency anomaly classification.
//!
//! Classification is advisory: every fault in the scoring service degrades
//! to "not anomalous" and is logged, never raised into the poll cycle.

pub mod classifier;

use thiserror::Error;

pub use self::classifier::{DisabledClassifier, HttpClassifier};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("classifier returned HTTP {0}")]
    Status(u16),

    #[error("classifier response malformed: {0}")]
    Malformed(String),
}

/// Scores a probe latency as anomalous or not.
#[async_trait::async_trait]
pub trait AnomalyClassifier: Send + Sync {
    /// Returns `false` on any failure (fail-open).
    async fn classify(&self, latency_ms: Option<u32>) -> bool;

    /// True while the backing service has been failing for long enough
    /// to be escalated.
    fn is_degraded(&self) -> bool {
        false
    }
}
