//! Endpoint probing and the outcome records it produces.

pub mod http;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sites::SiteId;

pub use self::http::HttpProber;

pub type OutcomeId = i64;

/// Status code recorded when no HTTP response was received at all.
pub const NETWORK_FAILURE_STATUS: u16 = 0;

/// Why a probe produced no HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Unreachable(String),
    Other(String),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timeout"),
            ProbeFailure::Unreachable(detail) => write!(f, "unreachable: {detail}"),
            ProbeFailure::Other(detail) => write!(f, "{detail}"),
        }
    }
}

/// Raw result of probing one URL once, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReading {
    pub checked_at: DateTime<Utc>,
    /// Absent when the request failed below HTTP.
    pub latency_ms: Option<u32>,
    pub status_code: u16,
    pub failure: Option<ProbeFailure>,
}

impl ProbeReading {
    /// A response was received (any status).
    pub fn responded(checked_at: DateTime<Utc>, status_code: u16, latency: Duration) -> Self {
        Self {
            checked_at,
            latency_ms: Some(u32::try_from(latency.as_millis()).unwrap_or(u32::MAX)),
            status_code,
            failure: None,
        }
    }

    /// No response was received.
    pub fn failed(checked_at: DateTime<Utc>, failure: ProbeFailure) -> Self {
        Self {
            checked_at,
            latency_ms: None,
            status_code: NETWORK_FAILURE_STATUS,
            failure: Some(failure),
        }
    }

    pub fn is_network_failure(&self) -> bool {
        self.status_code == NETWORK_FAILURE_STATUS
    }
}

/// A classified reading ready to be appended to the probe ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutcome {
    pub site_id: SiteId,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: Option<u32>,
    pub status_code: u16,
    pub is_anomaly: bool,
    pub error_message: Option<String>,
}

impl NewOutcome {
    pub fn from_reading(site_id: SiteId, reading: ProbeReading, is_anomaly: bool) -> Self {
        Self {
            site_id,
            checked_at: reading.checked_at,
            latency_ms: reading.latency_ms,
            status_code: reading.status_code,
            is_anomaly,
            error_message: reading.failure.map(|f| f.to_string()),
        }
    }
}

/// One persisted probe result. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub id: OutcomeId,
    pub site_id: SiteId,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: Option<u32>,
    /// HTTP status, or 0 for a network-level failure.
    pub status_code: u16,
    pub is_anomaly: bool,
    pub error_message: Option<String>,
}

impl ProbeOutcome {
    pub fn from_new(id: OutcomeId, new: NewOutcome) -> Self {
        Self {
            id,
            site_id: new.site_id,
            checked_at: new.checked_at,
            latency_ms: new.latency_ms,
            status_code: new.status_code,
            is_anomaly: new.is_anomaly,
            error_message: new.error_message,
        }
    }

    /// Anything outside `[200, 300)` counts as down, including network failures.
    pub fn is_down(&self) -> bool {
        !(200..300).contains(&self.status_code)
    }
}

/// Trait for endpoint probers.
///
/// Implementations never fail: every error is folded into a
/// [`ProbeReading`] with status 0.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeReading;
}
