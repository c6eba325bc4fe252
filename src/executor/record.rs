//! Execution audit records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probes::OutcomeId;
use crate::rules::{AutomationRule, RuleError, RuleId, TriggerType};
use crate::sites::SiteId;

pub type ExecutionId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            _ => Err(RuleError::Invalid(format!("unknown execution status '{value}'"))),
        }
    }
}

/// Why an execution was requested and against what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerContext {
    pub trigger: TriggerType,
    pub site_id: Option<SiteId>,
    pub outcome_id: Option<OutcomeId>,
    /// Overrides the rule's default arguments.
    pub arguments: Option<String>,
}

impl TriggerContext {
    /// Raised by the poll loop for a specific outcome.
    pub fn automatic(trigger: TriggerType, site_id: SiteId, outcome_id: OutcomeId) -> Self {
        Self {
            trigger,
            site_id: Some(site_id),
            outcome_id: Some(outcome_id),
            arguments: None,
        }
    }

    pub fn manual(site_id: Option<SiteId>, arguments: Option<String>) -> Self {
        Self {
            trigger: TriggerType::Manual,
            site_id,
            outcome_id: None,
            arguments,
        }
    }
}

/// Rule fields copied at trigger time so later rule edits leave history intact.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExecution {
    pub rule_id: RuleId,
    pub script_name: String,
    pub script_type: String,
    pub script_path: String,
    pub arguments: Option<String>,
    pub trigger_type: TriggerType,
    pub site_id: Option<SiteId>,
    pub outcome_id: Option<OutcomeId>,
    pub started_at: DateTime<Utc>,
}

impl NewExecution {
    pub fn snapshot(rule: &AutomationRule, ctx: &TriggerContext, started_at: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule.id,
            script_name: rule.name.clone(),
            script_type: rule.script_type.clone(),
            script_path: rule.script_path.clone(),
            arguments: ctx.arguments.clone().or_else(|| rule.default_arguments.clone()),
            trigger_type: ctx.trigger,
            site_id: ctx.site_id,
            outcome_id: ctx.outcome_id,
            started_at,
        }
    }
}

/// Final state written exactly once when an attempt ends.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error_output: String,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl Completion {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// One execution attempt as stored in the execution ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    /// Cleared if the rule is later deleted; the snapshot fields remain.
    pub rule_id: Option<RuleId>,
    pub script_name: String,
    pub script_type: String,
    pub script_path: String,
    pub arguments: Option<String>,
    pub trigger_type: TriggerType,
    pub site_id: Option<SiteId>,
    pub outcome_id: Option<OutcomeId>,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Freshly begun, still running.
    pub fn begin(id: ExecutionId, new: NewExecution) -> Self {
        Self {
            id,
            rule_id: Some(new.rule_id),
            script_name: new.script_name,
            script_type: new.script_type,
            script_path: new.script_path,
            arguments: new.arguments,
            trigger_type: new.trigger_type,
            site_id: new.site_id,
            outcome_id: new.outcome_id,
            status: ExecutionStatus::Running,
            exit_code: None,
            output: None,
            error_output: None,
            duration_ms: None,
            error_message: None,
            started_at: new.started_at,
            finished_at: None,
        }
    }

    pub fn finish(&mut self, completion: Completion) {
        self.status = completion.status;
        self.exit_code = completion.exit_code;
        self.output = Some(completion.output);
        self.error_output = Some(completion.error_output);
        self.duration_ms = Some(completion.duration_ms);
        self.error_message = completion.error_message;
        self.finished_at = Some(completion.finished_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{RuleStats, TriggerCondition};

    fn rule() -> AutomationRule {
        AutomationRule {
            id: 9,
            name: "Restart".to_string(),
            description: String::new(),
            script_type: "bash".to_string(),
            script_path: "restart.sh".to_string(),
            default_arguments: Some("nginx".to_string()),
            trigger_condition: TriggerCondition::Downtime,
            anomaly_threshold: 1,
            downtime_threshold: 1,
            is_active: true,
            created_at: Utc::now(),
            stats: RuleStats::default(),
            notes: None,
        }
    }

    #[test]
    fn test_snapshot_uses_override_arguments() {
        let now = Utc::now();
        let snap = NewExecution::snapshot(&rule(), &TriggerContext::manual(None, Some("apache2".into())), now);
        assert_eq!(snap.arguments.as_deref(), Some("apache2"));

        let snap = NewExecution::snapshot(&rule(), &TriggerContext::automatic(TriggerType::Downtime, 1, 2), now);
        assert_eq!(snap.arguments.as_deref(), Some("nginx"));
        assert_eq!(snap.site_id, Some(1));
        assert_eq!(snap.outcome_id, Some(2));
    }

    #[test]
    fn test_snapshot_survives_rule_edit() {
        let mut r = rule();
        let record = ExecutionRecord::begin(
            1,
            NewExecution::snapshot(&r, &TriggerContext::manual(None, None), Utc::now()),
        );
        r.name = "Renamed".to_string();
        r.script_path = "other.sh".to_string();
        assert_eq!(record.script_name, "Restart");
        assert_eq!(record.script_path, "restart.sh");
    }

    #[test]
    fn test_finish_sets_terminal_state() {
        let mut record = ExecutionRecord::begin(
            1,
            NewExecution::snapshot(&rule(), &TriggerContext::manual(None, None), Utc::now()),
        );
        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(!record.status.is_terminal());

        record.finish(Completion {
            status: ExecutionStatus::Failed,
            exit_code: Some(3),
            output: String::new(),
            error_output: "boom".to_string(),
            duration_ms: 12,
            error_message: Some("boom".to_string()),
            finished_at: Utc::now(),
        });
        assert!(record.status.is_terminal());
        assert_eq!(record.exit_code, Some(3));
        assert_eq!(record.duration_ms, Some(12));
    }
}
