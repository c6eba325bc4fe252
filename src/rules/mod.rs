//! Automation rules: which remediation script to run, and when.

pub mod defaults;
pub mod evaluator;

use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::evaluator::{OutcomeClass, RuleEvaluator};

pub type RuleId = i64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("unsupported script type '{0}' (expected bash, powershell or python)")]
    UnsupportedScriptKind(String),

    #[error("unknown trigger condition '{0}' (expected anomaly, downtime or both)")]
    UnknownCondition(String),

    #[error("invalid rule: {0}")]
    Invalid(String),
}

/// Interpreter used to launch a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Bash,
    PowerShell,
    Python,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Bash => "bash",
            ScriptKind::PowerShell => "powershell",
            ScriptKind::Python => "python",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptKind {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bash" => Ok(ScriptKind::Bash),
            "powershell" => Ok(ScriptKind::PowerShell),
            "python" => Ok(ScriptKind::Python),
            _ => Err(RuleError::UnsupportedScriptKind(value.to_string())),
        }
    }
}

/// Category of outcome a rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerCondition {
    Anomaly,
    Downtime,
    Both,
}

impl TriggerCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCondition::Anomaly => "anomaly",
            TriggerCondition::Downtime => "downtime",
            TriggerCondition::Both => "both",
        }
    }

    pub fn watches_anomalies(&self) -> bool {
        matches!(self, TriggerCondition::Anomaly | TriggerCondition::Both)
    }

    pub fn watches_downtime(&self) -> bool {
        matches!(self, TriggerCondition::Downtime | TriggerCondition::Both)
    }
}

impl FromStr for TriggerCondition {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anomaly" => Ok(TriggerCondition::Anomaly),
            "downtime" => Ok(TriggerCondition::Downtime),
            "both" => Ok(TriggerCondition::Both),
            _ => Err(RuleError::UnknownCondition(value.to_string())),
        }
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Anomaly,
    Downtime,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Anomaly => "anomaly",
            TriggerType::Downtime => "downtime",
            TriggerType::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = RuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "anomaly" => Ok(TriggerType::Anomaly),
            "downtime" => Ok(TriggerType::Downtime),
            "manual" => Ok(TriggerType::Manual),
            _ => Err(RuleError::Invalid(format!("unknown trigger type '{value}'"))),
        }
    }
}

/// Rolling execution statistics, updated once per finished attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub execution_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub average_duration_ms: Option<u64>,
    pub last_executed: Option<DateTime<Utc>>,
}

impl RuleStats {
    /// Fold one finished attempt into the statistics.
    ///
    /// The running mean is taken over `success_count + failure_count` after
    /// the counters have been incremented.
    pub fn record(&mut self, success: bool, duration: Duration, finished_at: DateTime<Utc>) {
        self.execution_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }

        let sample = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let n = u64::from(self.success_count + self.failure_count);
        self.average_duration_ms = Some(match self.average_duration_ms {
            Some(avg) if n > 1 => (avg.saturating_mul(n - 1).saturating_add(sample)) / n,
            _ => sample,
        });
        self.last_executed = Some(finished_at);
    }
}

/// A configured remediation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub name: String,
    pub description: String,
    /// Stored as written; resolved to a [`ScriptKind`] only when executed.
    pub script_type: String,
    /// Relative to the scripts root.
    pub script_path: String,
    pub default_arguments: Option<String>,
    pub trigger_condition: TriggerCondition,
    /// Anomalous outcomes required among the newest `anomaly_threshold`.
    pub anomaly_threshold: u32,
    /// Non-2xx outcomes required among the newest `downtime_threshold`.
    pub downtime_threshold: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: RuleStats,
    pub notes: Option<String>,
}

impl AutomationRule {
    pub fn script_kind(&self) -> Result<ScriptKind, RuleError> {
        self.script_type.parse()
    }

    /// Number of history entries needed to evaluate this rule.
    pub fn history_depth(&self) -> usize {
        self.anomaly_threshold.max(self.downtime_threshold) as usize
    }
}

fn default_threshold() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

/// Fields supplied when creating or editing a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub script_type: String,
    pub script_path: String,
    #[serde(default)]
    pub default_arguments: Option<String>,
    pub trigger_condition: TriggerCondition,
    #[serde(default = "default_threshold")]
    pub anomaly_threshold: u32,
    #[serde(default = "default_threshold")]
    pub downtime_threshold: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub notes: Option<String>,
    /// Administrative edit: clear the rolling statistics.
    #[serde(default)]
    pub reset_stats: bool,
}

impl RuleDraft {
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::Invalid("name must not be empty".to_string()));
        }
        self.script_type.parse::<ScriptKind>()?;
        validate_script_path(&self.script_path)?;
        if self.anomaly_threshold == 0 || self.downtime_threshold == 0 {
            return Err(RuleError::Invalid("thresholds must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Build the stored rule for a fresh insert.
    pub fn into_rule(self, id: RuleId, created_at: DateTime<Utc>) -> AutomationRule {
        AutomationRule {
            id,
            name: self.name,
            description: self.description,
            script_type: self.script_type.trim().to_ascii_lowercase(),
            script_path: self.script_path,
            default_arguments: self.default_arguments,
            trigger_condition: self.trigger_condition,
            anomaly_threshold: self.anomaly_threshold,
            downtime_threshold: self.downtime_threshold,
            is_active: self.is_active,
            created_at,
            stats: RuleStats::default(),
            notes: self.notes,
        }
    }

    /// Apply an edit to an existing rule, keeping identity and (unless
    /// reset) statistics.
    pub fn apply_to(self, existing: &AutomationRule) -> AutomationRule {
        let stats = if self.reset_stats {
            RuleStats::default()
        } else {
            existing.stats.clone()
        };
        AutomationRule {
            stats,
            ..self.into_rule(existing.id, existing.created_at)
        }
    }
}

/// Script paths must stay inside the scripts root.
fn validate_script_path(path: &str) -> Result<(), RuleError> {
    if path.trim().is_empty() {
        return Err(RuleError::Invalid("script path must not be empty".to_string()));
    }
    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(RuleError::Invalid(format!(
            "script path '{path}' must be relative to the scripts directory"
        )));
    }
    Ok(())
}
