//! In-process store with the same semantics as the SQLite one.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{ExecutionLedger, ProbeLedger, RuleStore, SiteRegistry, StorageError, StorageResult};
use crate::executor::record::{Completion, ExecutionId, ExecutionRecord, ExecutionStatus, NewExecution};
use crate::probes::{NewOutcome, OutcomeId, ProbeOutcome};
use crate::rules::{AutomationRule, RuleDraft, RuleId, RuleStats};
use crate::sites::{MonitoredSite, SiteDraft, SiteId};

#[derive(Default)]
struct Inner {
    next_id: i64,
    sites: BTreeMap<SiteId, MonitoredSite>,
    outcomes: BTreeMap<OutcomeId, ProbeOutcome>,
    rules: BTreeMap<RuleId, AutomationRule>,
    executions: BTreeMap<ExecutionId, ExecutionRecord>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn newest_first(a: &ProbeOutcome, b: &ProbeOutcome) -> std::cmp::Ordering {
    b.checked_at.cmp(&a.checked_at).then(b.id.cmp(&a.id))
}

#[async_trait::async_trait]
impl SiteRegistry for MemoryStore {
    async fn list_active_sites(&self) -> StorageResult<Vec<MonitoredSite>> {
        Ok(self.lock().sites.values().filter(|s| s.is_active).cloned().collect())
    }

    async fn list_sites(&self) -> StorageResult<Vec<MonitoredSite>> {
        Ok(self.lock().sites.values().cloned().collect())
    }

    async fn get_site(&self, id: SiteId) -> StorageResult<MonitoredSite> {
        self.lock()
            .sites
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { entity: "site", id })
    }

    async fn add_site(&self, draft: SiteDraft) -> StorageResult<MonitoredSite> {
        let mut inner = self.lock();
        let site = MonitoredSite {
            id: inner.next_id(),
            url: draft.url,
            name: draft.name,
            is_active: draft.is_active,
            created_at: Utc::now(),
        };
        inner.sites.insert(site.id, site.clone());
        Ok(site)
    }

    async fn update_site(&self, id: SiteId, draft: SiteDraft) -> StorageResult<MonitoredSite> {
        let mut inner = self.lock();
        let site = inner
            .sites
            .get_mut(&id)
            .ok_or(StorageError::NotFound { entity: "site", id })?;
        site.url = draft.url;
        site.name = draft.name;
        site.is_active = draft.is_active;
        Ok(site.clone())
    }

    async fn deactivate_site(&self, id: SiteId) -> StorageResult<()> {
        let mut inner = self.lock();
        let site = inner
            .sites
            .get_mut(&id)
            .ok_or(StorageError::NotFound { entity: "site", id })?;
        site.is_active = false;
        Ok(())
    }

    async fn remove_site(&self, id: SiteId) -> StorageResult<()> {
        let mut inner = self.lock();
        if inner.sites.remove(&id).is_none() {
            return Err(StorageError::NotFound { entity: "site", id });
        }
        inner.outcomes.retain(|_, o| o.site_id != id);
        for record in inner.executions.values_mut() {
            if record.site_id == Some(id) {
                record.site_id = None;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProbeLedger for MemoryStore {
    async fn append(&self, outcome: NewOutcome) -> StorageResult<ProbeOutcome> {
        let mut inner = self.lock();
        if !inner.sites.contains_key(&outcome.site_id) {
            return Err(StorageError::NotFound { entity: "site", id: outcome.site_id });
        }
        let stored = ProbeOutcome::from_new(inner.next_id(), outcome);
        inner.outcomes.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn recent_for_site(&self, site_id: SiteId, limit: usize) -> StorageResult<Vec<ProbeOutcome>> {
        let inner = self.lock();
        let mut rows: Vec<ProbeOutcome> = inner
            .outcomes
            .values()
            .filter(|o| o.site_id == site_id)
            .cloned()
            .collect();
        rows.sort_by(newest_first);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn latest_per_site(&self) -> StorageResult<Vec<ProbeOutcome>> {
        let inner = self.lock();
        let mut latest: BTreeMap<SiteId, &ProbeOutcome> = BTreeMap::new();
        for outcome in inner.outcomes.values() {
            match latest.get(&outcome.site_id) {
                Some(current) if newest_first(current, outcome).is_le() => {}
                _ => {
                    latest.insert(outcome.site_id, outcome);
                }
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.lock();
        let before = inner.outcomes.len();
        inner.outcomes.retain(|_, o| o.checked_at >= cutoff);
        let deleted = before - inner.outcomes.len();

        let Inner { outcomes, executions, .. } = &mut *inner;
        for record in executions.values_mut() {
            if record.outcome_id.is_some_and(|id| !outcomes.contains_key(&id)) {
                record.outcome_id = None;
            }
        }
        Ok(deleted)
    }
}

#[async_trait::async_trait]
impl RuleStore for MemoryStore {
    async fn list_rules(&self) -> StorageResult<Vec<AutomationRule>> {
        let mut rules: Vec<AutomationRule> = self.lock().rules.values().cloned().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn list_active_rules(&self) -> StorageResult<Vec<AutomationRule>> {
        let mut rules = self.list_rules().await?;
        rules.retain(|r| r.is_active);
        Ok(rules)
    }

    async fn get_rule(&self, id: RuleId) -> StorageResult<AutomationRule> {
        self.lock()
            .rules
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { entity: "rule", id })
    }

    async fn create_rule(&self, draft: RuleDraft) -> StorageResult<AutomationRule> {
        let mut inner = self.lock();
        let rule = draft.into_rule(inner.next_id(), Utc::now());
        inner.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, id: RuleId, draft: RuleDraft) -> StorageResult<AutomationRule> {
        let mut inner = self.lock();
        let existing = inner
            .rules
            .get_mut(&id)
            .ok_or(StorageError::NotFound { entity: "rule", id })?;
        *existing = draft.apply_to(existing);
        Ok(existing.clone())
    }

    async fn delete_rule(&self, id: RuleId) -> StorageResult<()> {
        let mut inner = self.lock();
        if inner.rules.remove(&id).is_none() {
            return Err(StorageError::NotFound { entity: "rule", id });
        }
        for record in inner.executions.values_mut() {
            if record.rule_id == Some(id) {
                record.rule_id = None;
            }
        }
        Ok(())
    }

    async fn record_completion(
        &self,
        id: RuleId,
        success: bool,
        duration: Duration,
        finished_at: DateTime<Utc>,
    ) -> StorageResult<RuleStats> {
        let mut inner = self.lock();
        let rule = inner
            .rules
            .get_mut(&id)
            .ok_or(StorageError::NotFound { entity: "rule", id })?;
        rule.stats.record(success, duration, finished_at);
        Ok(rule.stats.clone())
    }
}

#[async_trait::async_trait]
impl ExecutionLedger for MemoryStore {
    async fn begin_execution(&self, new: NewExecution) -> StorageResult<ExecutionRecord> {
        let mut inner = self.lock();
        let mut record = ExecutionRecord::begin(inner.next_id(), new);
        if record.rule_id.is_some_and(|id| !inner.rules.contains_key(&id)) {
            record.rule_id = None;
        }
        if record.site_id.is_some_and(|id| !inner.sites.contains_key(&id)) {
            record.site_id = None;
        }
        if record.outcome_id.is_some_and(|id| !inner.outcomes.contains_key(&id)) {
            record.outcome_id = None;
        }
        inner.executions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn finish_execution(&self, id: ExecutionId, completion: Completion) -> StorageResult<ExecutionRecord> {
        let mut inner = self.lock();
        let record = inner
            .executions
            .get_mut(&id)
            .ok_or(StorageError::NotFound { entity: "execution", id })?;
        if record.status != ExecutionStatus::Running {
            return Err(StorageError::AlreadyFinalized(id));
        }
        record.finish(completion);
        Ok(record.clone())
    }

    async fn get_execution(&self, id: ExecutionId) -> StorageResult<ExecutionRecord> {
        self.lock()
            .executions
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { entity: "execution", id })
    }

    async fn recent_executions(&self, limit: usize, site_id: Option<SiteId>) -> StorageResult<Vec<ExecutionRecord>> {
        let inner = self.lock();
        let mut rows: Vec<ExecutionRecord> = inner
            .executions
            .values()
            .filter(|r| site_id.is_none() || r.site_id == site_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn stale_executions(&self) -> StorageResult<Vec<ExecutionRecord>> {
        let inner = self.lock();
        let mut rows: Vec<ExecutionRecord> = inner
            .executions
            .values()
            .filter(|r| r.status == ExecutionStatus::Running)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.started_at);
        Ok(rows)
    }
}
