//! Decides which rules fire for a freshly persisted outcome.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{AutomationRule, TriggerCondition, TriggerType};
use crate::probes::ProbeOutcome;
use crate::storage::ProbeLedger;

/// Classification of a single outcome for trigger matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Normal,
    Anomaly,
    Downtime,
}

impl OutcomeClass {
    /// Anomaly takes precedence over downtime. Network failures (status 0)
    /// are stored as anomalous, so they feed `anomaly` and `both` rules and
    /// never fire a `downtime`-only rule.
    pub fn of(outcome: &ProbeOutcome) -> Self {
        if outcome.is_anomaly {
            OutcomeClass::Anomaly
        } else if outcome.is_down() {
            OutcomeClass::Downtime
        } else {
            OutcomeClass::Normal
        }
    }

    pub fn trigger_type(self) -> Option<TriggerType> {
        match self {
            OutcomeClass::Normal => None,
            OutcomeClass::Anomaly => Some(TriggerType::Anomaly),
            OutcomeClass::Downtime => Some(TriggerType::Downtime),
        }
    }
}

fn condition_matches(condition: TriggerCondition, class: OutcomeClass) -> bool {
    match (condition, class) {
        (_, OutcomeClass::Normal) => false,
        (TriggerCondition::Both, _) => true,
        (TriggerCondition::Anomaly, OutcomeClass::Anomaly) => true,
        (TriggerCondition::Downtime, OutcomeClass::Downtime) => true,
        _ => false,
    }
}

/// Pure trigger decision over a site's history, newest first.
///
/// For `both`, either sub-condition alone is sufficient.
pub fn should_trigger(rule: &AutomationRule, class: OutcomeClass, history: &[ProbeOutcome]) -> bool {
    if !rule.is_active || !condition_matches(rule.trigger_condition, class) || history.is_empty() {
        return false;
    }

    let condition = rule.trigger_condition;

    if condition.watches_anomalies() {
        let threshold = rule.anomaly_threshold as usize;
        let anomalies = history.iter().take(threshold).filter(|o| o.is_anomaly).count();
        if anomalies >= threshold {
            return true;
        }
    }

    if condition.watches_downtime() {
        let threshold = rule.downtime_threshold as usize;
        let downs = history.iter().take(threshold).filter(|o| o.is_down()).count();
        if downs >= threshold {
            return true;
        }
    }

    false
}

/// Fetches history from the probe ledger and applies [`should_trigger`].
#[derive(Clone)]
pub struct RuleEvaluator {
    ledger: Arc<dyn ProbeLedger>,
}

impl RuleEvaluator {
    pub fn new(ledger: Arc<dyn ProbeLedger>) -> Self {
        Self { ledger }
    }

    /// Return the rules (from `rules`) that fire for `outcome`.
    ///
    /// A history read failure skips only the affected rule.
    pub async fn triggered<'a>(
        &self,
        outcome: &ProbeOutcome,
        rules: &'a [AutomationRule],
    ) -> Vec<&'a AutomationRule> {
        let class = OutcomeClass::of(outcome);
        if class == OutcomeClass::Normal {
            return Vec::new();
        }

        let mut fired = Vec::new();
        for rule in rules {
            if !rule.is_active || !condition_matches(rule.trigger_condition, class) {
                continue;
            }

            let history = match self
                .ledger
                .recent_for_site(outcome.site_id, rule.history_depth())
                .await
            {
                Ok(h) => h,
                Err(e) => {
                    warn!(rule_id = rule.id, site_id = outcome.site_id, error = %e, "Failed to load history for rule evaluation");
                    continue;
                }
            };

            if should_trigger(rule, class, &history) {
                debug!(rule_id = rule.id, site_id = outcome.site_id, ?class, "Rule triggered");
                fired.push(rule);
            }
        }
        fired
    }
}
