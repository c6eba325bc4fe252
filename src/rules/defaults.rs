//! Out-of-box remediation rules, seeded when the rule table is empty.

use super::{RuleDraft, TriggerCondition};

fn restart_rule(name: &str, description: &str, script_type: &str, script_path: &str, service: &str) -> RuleDraft {
    RuleDraft {
        name: name.to_string(),
        description: description.to_string(),
        script_type: script_type.to_string(),
        script_path: script_path.to_string(),
        default_arguments: Some(service.to_string()),
        trigger_condition: TriggerCondition::Downtime,
        anomaly_threshold: 1,
        downtime_threshold: 2,
        is_active: true,
        notes: None,
        reset_stats: false,
    }
}

/// Return the default rule set.
pub fn defaults() -> Vec<RuleDraft> {
    vec![
        restart_rule(
            "Restart Service (Bash)",
            "Restarts a system service using bash script",
            "bash",
            "restart_service.sh",
            "nginx",
        ),
        restart_rule(
            "Restart Service (PowerShell)",
            "Restarts a Windows service using PowerShell",
            "powershell",
            "restart_service.ps1",
            "Themes",
        ),
        restart_rule(
            "Restart Service (Python)",
            "Restarts a system service using Python script",
            "python",
            "restart_service.py",
            "apache2",
        ),
    ]
}
