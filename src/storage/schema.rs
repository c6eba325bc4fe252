//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sites (
            id INTEGER PRIMARY KEY,
            url TEXT NOT NULL,
            name TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS probe_outcomes (
            id INTEGER PRIMARY KEY,
            site_id INTEGER NOT NULL,
            checked_at TEXT NOT NULL,
            latency_ms INTEGER,
            status_code INTEGER NOT NULL,
            is_anomaly INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            FOREIGN KEY (site_id) REFERENCES sites(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS automation_rules (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            script_type TEXT NOT NULL,
            script_path TEXT NOT NULL,
            default_arguments TEXT,
            trigger_condition TEXT NOT NULL,
            anomaly_threshold INTEGER NOT NULL DEFAULT 1,
            downtime_threshold INTEGER NOT NULL DEFAULT 1,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            last_executed TEXT,
            execution_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            average_duration_ms INTEGER,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS script_executions (
            id INTEGER PRIMARY KEY,
            rule_id INTEGER,
            script_name TEXT NOT NULL,
            script_type TEXT NOT NULL,
            script_path TEXT NOT NULL,
            arguments TEXT,
            trigger_type TEXT NOT NULL,
            site_id INTEGER,
            outcome_id INTEGER,
            status TEXT NOT NULL,
            exit_code INTEGER,
            output TEXT,
            error_output TEXT,
            duration_ms INTEGER,
            error_message TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            FOREIGN KEY (rule_id) REFERENCES automation_rules(id) ON DELETE SET NULL,
            FOREIGN KEY (site_id) REFERENCES sites(id) ON DELETE SET NULL,
            FOREIGN KEY (outcome_id) REFERENCES probe_outcomes(id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS idx_probe_outcomes_site_checked ON probe_outcomes(site_id, checked_at);
        CREATE INDEX IF NOT EXISTS idx_probe_outcomes_checked ON probe_outcomes(checked_at);
        CREATE INDEX IF NOT EXISTS idx_script_executions_started ON script_executions(started_at);
        CREATE INDEX IF NOT EXISTS idx_script_executions_status ON script_executions(status);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}
