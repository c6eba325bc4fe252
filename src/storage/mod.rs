//! Storage contracts and their SQLite / in-memory implementations.
//!
//! The poll loop and executor only see the traits below, so the core runs
//! against [`MemoryStore`] in tests and [`SqliteStore`] in the daemon.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::executor::record::{Completion, ExecutionId, ExecutionRecord, NewExecution};
use crate::probes::{NewOutcome, ProbeOutcome};
use crate::rules::{AutomationRule, RuleDraft, RuleId, RuleStats};
use crate::sites::{MonitoredSite, SiteDraft, SiteId};

pub use self::memory::MemoryStore;
pub use self::sqlite::{open_pool, Pool, SqliteStore};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("execution {0} was already finalized")]
    AlreadyFinalized(ExecutionId),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Registered endpoints.
#[async_trait::async_trait]
pub trait SiteRegistry: Send + Sync {
    async fn list_active_sites(&self) -> StorageResult<Vec<MonitoredSite>>;
    async fn list_sites(&self) -> StorageResult<Vec<MonitoredSite>>;
    async fn get_site(&self, id: SiteId) -> StorageResult<MonitoredSite>;
    async fn add_site(&self, draft: SiteDraft) -> StorageResult<MonitoredSite>;
    async fn update_site(&self, id: SiteId, draft: SiteDraft) -> StorageResult<MonitoredSite>;
    async fn deactivate_site(&self, id: SiteId) -> StorageResult<()>;
    /// Removes the site and every outcome recorded for it.
    async fn remove_site(&self, id: SiteId) -> StorageResult<()>;
}

/// Append-only record of probe outcomes.
#[async_trait::async_trait]
pub trait ProbeLedger: Send + Sync {
    async fn append(&self, outcome: NewOutcome) -> StorageResult<ProbeOutcome>;
    /// Most recent `limit` outcomes for a site, newest first.
    async fn recent_for_site(&self, site_id: SiteId, limit: usize) -> StorageResult<Vec<ProbeOutcome>>;
    /// The newest outcome of every site that has one.
    async fn latest_per_site(&self) -> StorageResult<Vec<ProbeOutcome>>;
    /// Deletes outcomes checked strictly before `cutoff`; returns the count.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

/// Automation rules and their rolling statistics.
#[async_trait::async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_rules(&self) -> StorageResult<Vec<AutomationRule>>;
    async fn list_active_rules(&self) -> StorageResult<Vec<AutomationRule>>;
    async fn get_rule(&self, id: RuleId) -> StorageResult<AutomationRule>;
    async fn create_rule(&self, draft: RuleDraft) -> StorageResult<AutomationRule>;
    async fn update_rule(&self, id: RuleId, draft: RuleDraft) -> StorageResult<AutomationRule>;
    async fn delete_rule(&self, id: RuleId) -> StorageResult<()>;
    /// Read-modify-write of one rule's statistics for a finished attempt.
    async fn record_completion(
        &self,
        id: RuleId,
        success: bool,
        duration: Duration,
        finished_at: DateTime<Utc>,
    ) -> StorageResult<RuleStats>;
}

/// Audit trail of execution attempts.
#[async_trait::async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Persist a new attempt in `running` state.
    async fn begin_execution(&self, new: NewExecution) -> StorageResult<ExecutionRecord>;
    async fn finish_execution(&self, id: ExecutionId, completion: Completion) -> StorageResult<ExecutionRecord>;
    async fn get_execution(&self, id: ExecutionId) -> StorageResult<ExecutionRecord>;
    /// Newest first, optionally restricted to one site.
    async fn recent_executions(&self, limit: usize, site_id: Option<SiteId>) -> StorageResult<Vec<ExecutionRecord>>;
    /// Attempts still marked `running`.
    async fn stale_executions(&self) -> StorageResult<Vec<ExecutionRecord>>;
}

/// Everything the daemon needs from one backing store.
pub trait Store: SiteRegistry + ProbeLedger + RuleStore + ExecutionLedger {}

impl<T> Store for T where T: SiteRegistry + ProbeLedger + RuleStore + ExecutionLedger {}

/// Insert the default rules when no rule exists yet. Returns how many were added.
pub async fn seed_default_rules(rules: &dyn RuleStore) -> StorageResult<usize> {
    if !rules.list_rules().await?.is_empty() {
        return Ok(0);
    }
    let defaults = crate::rules::defaults::defaults();
    let count = defaults.len();
    for draft in defaults {
        rules.create_rule(draft).await?;
    }
    tracing::info!(count, "Seeded default automation rules");
    Ok(count)
}
