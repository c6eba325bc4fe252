//! SQLite-backed store.
//!
//! Every query runs on the blocking pool; timestamps are stored as RFC 3339
//! UTC with millisecond precision so string order equals time order.

use std::error::Error as StdError;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{
    schema, ExecutionLedger, ProbeLedger, RuleStore, SiteRegistry, StorageError, StorageResult,
};
use crate::executor::record::{Completion, ExecutionId, ExecutionRecord, ExecutionStatus, NewExecution};
use crate::probes::{NewOutcome, ProbeOutcome};
use crate::rules::{AutomationRule, RuleDraft, RuleId, RuleStats};
use crate::sites::{MonitoredSite, SiteDraft, SiteId};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(PRAGMAS));
    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A private in-memory database behind a single-connection pool.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    // Recycling the only connection would drop the database.
    let pool = R2D2Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(open_memory_pool()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: StdError + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: StdError + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn opt_u64_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let raw: Option<i64> = row.get(idx)?;
    Ok(raw.map(|v| u64::try_from(v).unwrap_or(0)))
}

fn opt_i64(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

const SITE_COLUMNS: &str = "id, url, name, is_active, created_at";

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<MonitoredSite> {
    Ok(MonitoredSite {
        id: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        is_active: row.get(3)?,
        created_at: ts_at(row, 4)?,
    })
}

const OUTCOME_COLUMNS: &str =
    "id, site_id, checked_at, latency_ms, status_code, is_anomaly, error_message";

fn outcome_from_row(row: &Row<'_>) -> rusqlite::Result<ProbeOutcome> {
    Ok(ProbeOutcome {
        id: row.get(0)?,
        site_id: row.get(1)?,
        checked_at: ts_at(row, 2)?,
        latency_ms: row.get(3)?,
        status_code: row.get(4)?,
        is_anomaly: row.get(5)?,
        error_message: row.get(6)?,
    })
}

const RULE_COLUMNS: &str = "id, name, description, script_type, script_path, default_arguments,
     trigger_condition, anomaly_threshold, downtime_threshold, is_active, created_at,
     last_executed, execution_count, success_count, failure_count, average_duration_ms, notes";

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationRule> {
    Ok(AutomationRule {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        script_type: row.get(3)?,
        script_path: row.get(4)?,
        default_arguments: row.get(5)?,
        trigger_condition: parsed_at(row, 6)?,
        anomaly_threshold: row.get(7)?,
        downtime_threshold: row.get(8)?,
        is_active: row.get(9)?,
        created_at: ts_at(row, 10)?,
        stats: RuleStats {
            last_executed: opt_ts_at(row, 11)?,
            execution_count: row.get(12)?,
            success_count: row.get(13)?,
            failure_count: row.get(14)?,
            average_duration_ms: opt_u64_at(row, 15)?,
        },
        notes: row.get(16)?,
    })
}

const EXECUTION_COLUMNS: &str = "id, rule_id, script_name, script_type, script_path, arguments,
     trigger_type, site_id, outcome_id, status, exit_code, output, error_output, duration_ms,
     error_message, started_at, finished_at";

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        script_name: row.get(2)?,
        script_type: row.get(3)?,
        script_path: row.get(4)?,
        arguments: row.get(5)?,
        trigger_type: parsed_at(row, 6)?,
        site_id: row.get(7)?,
        outcome_id: row.get(8)?,
        status: parsed_at(row, 9)?,
        exit_code: row.get(10)?,
        output: row.get(11)?,
        error_output: row.get(12)?,
        duration_ms: opt_u64_at(row, 13)?,
        error_message: row.get(14)?,
        started_at: ts_at(row, 15)?,
        finished_at: opt_ts_at(row, 16)?,
    })
}

fn fetch_site(conn: &Connection, id: SiteId) -> StorageResult<MonitoredSite> {
    conn.query_row(
        &format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"),
        params![id],
        site_from_row,
    )
    .optional()?
    .ok_or(StorageError::NotFound { entity: "site", id })
}

fn fetch_rule(conn: &Connection, id: RuleId) -> StorageResult<AutomationRule> {
    conn.query_row(
        &format!("SELECT {RULE_COLUMNS} FROM automation_rules WHERE id = ?1"),
        params![id],
        rule_from_row,
    )
    .optional()?
    .ok_or(StorageError::NotFound { entity: "rule", id })
}

fn fetch_execution(conn: &Connection, id: ExecutionId) -> StorageResult<ExecutionRecord> {
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM script_executions WHERE id = ?1"),
        params![id],
        execution_from_row,
    )
    .optional()?
    .ok_or(StorageError::NotFound { entity: "execution", id })
}

fn write_rule(conn: &Connection, rule: &AutomationRule) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE automation_rules SET
            name = ?2, description = ?3, script_type = ?4, script_path = ?5,
            default_arguments = ?6, trigger_condition = ?7, anomaly_threshold = ?8,
            downtime_threshold = ?9, is_active = ?10, last_executed = ?11,
            execution_count = ?12, success_count = ?13, failure_count = ?14,
            average_duration_ms = ?15, notes = ?16
         WHERE id = ?1",
        params![
            rule.id,
            rule.name,
            rule.description,
            rule.script_type,
            rule.script_path,
            rule.default_arguments,
            rule.trigger_condition.as_str(),
            rule.anomaly_threshold,
            rule.downtime_threshold,
            rule.is_active,
            rule.stats.last_executed.as_ref().map(fmt_ts),
            rule.stats.execution_count,
            rule.stats.success_count,
            rule.stats.failure_count,
            opt_i64(rule.stats.average_duration_ms),
            rule.notes,
        ],
    )
}

/// The site referenced by an insert no longer exists.
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn collect<T, F>(conn: &Connection, sql: &str, params: impl rusqlite::Params, f: F) -> StorageResult<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, f)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Sites
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl SiteRegistry for SqliteStore {
    async fn list_active_sites(&self) -> StorageResult<Vec<MonitoredSite>> {
        self.with_conn(|conn| {
            collect(
                conn,
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE is_active = 1 ORDER BY id"),
                [],
                site_from_row,
            )
        })
        .await
    }

    async fn list_sites(&self) -> StorageResult<Vec<MonitoredSite>> {
        self.with_conn(|conn| {
            collect(
                conn,
                &format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY id"),
                [],
                site_from_row,
            )
        })
        .await
    }

    async fn get_site(&self, id: SiteId) -> StorageResult<MonitoredSite> {
        self.with_conn(move |conn| fetch_site(conn, id)).await
    }

    async fn add_site(&self, draft: SiteDraft) -> StorageResult<MonitoredSite> {
        self.with_conn(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO sites (url, name, is_active, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![draft.url, draft.name, draft.is_active, fmt_ts(&created_at)],
            )?;
            Ok(MonitoredSite {
                id: conn.last_insert_rowid(),
                url: draft.url,
                name: draft.name,
                is_active: draft.is_active,
                created_at,
            })
        })
        .await
    }

    async fn update_site(&self, id: SiteId, draft: SiteDraft) -> StorageResult<MonitoredSite> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sites SET url = ?2, name = ?3, is_active = ?4 WHERE id = ?1",
                params![id, draft.url, draft.name, draft.is_active],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound { entity: "site", id });
            }
            fetch_site(conn, id)
        })
        .await
    }

    async fn deactivate_site(&self, id: SiteId) -> StorageResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute("UPDATE sites SET is_active = 0 WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StorageError::NotFound { entity: "site", id });
            }
            Ok(())
        })
        .await
    }

    async fn remove_site(&self, id: SiteId) -> StorageResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM sites WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StorageError::NotFound { entity: "site", id });
            }
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Probe outcomes
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ProbeLedger for SqliteStore {
    async fn append(&self, outcome: NewOutcome) -> StorageResult<ProbeOutcome> {
        self.with_conn(move |conn| {
            let site_id = outcome.site_id;
            let inserted = conn.execute(
                "INSERT INTO probe_outcomes
                    (site_id, checked_at, latency_ms, status_code, is_anomaly, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    outcome.site_id,
                    fmt_ts(&outcome.checked_at),
                    outcome.latency_ms,
                    outcome.status_code,
                    outcome.is_anomaly,
                    outcome.error_message,
                ],
            );
            match inserted {
                Err(e) if is_constraint_violation(&e) => {
                    return Err(StorageError::NotFound { entity: "site", id: site_id })
                }
                other => other?,
            };
            Ok(ProbeOutcome::from_new(conn.last_insert_rowid(), outcome))
        })
        .await
    }

    async fn recent_for_site(&self, site_id: SiteId, limit: usize) -> StorageResult<Vec<ProbeOutcome>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            collect(
                conn,
                &format!(
                    "SELECT {OUTCOME_COLUMNS} FROM probe_outcomes
                     WHERE site_id = ?1
                     ORDER BY checked_at DESC, id DESC
                     LIMIT ?2"
                ),
                params![site_id, limit],
                outcome_from_row,
            )
        })
        .await
    }

    async fn latest_per_site(&self) -> StorageResult<Vec<ProbeOutcome>> {
        self.with_conn(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {OUTCOME_COLUMNS} FROM probe_outcomes p
                     WHERE p.id = (
                        SELECT q.id FROM probe_outcomes q
                        WHERE q.site_id = p.site_id
                        ORDER BY q.checked_at DESC, q.id DESC
                        LIMIT 1
                     )
                     ORDER BY p.site_id"
                ),
                [],
                outcome_from_row,
            )
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM probe_outcomes WHERE checked_at < ?1",
                params![fmt_ts(&cutoff)],
            )?;
            Ok(deleted)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl RuleStore for SqliteStore {
    async fn list_rules(&self) -> StorageResult<Vec<AutomationRule>> {
        self.with_conn(|conn| {
            collect(
                conn,
                &format!("SELECT {RULE_COLUMNS} FROM automation_rules ORDER BY name, id"),
                [],
                rule_from_row,
            )
        })
        .await
    }

    async fn list_active_rules(&self) -> StorageResult<Vec<AutomationRule>> {
        self.with_conn(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {RULE_COLUMNS} FROM automation_rules WHERE is_active = 1 ORDER BY name, id"
                ),
                [],
                rule_from_row,
            )
        })
        .await
    }

    async fn get_rule(&self, id: RuleId) -> StorageResult<AutomationRule> {
        self.with_conn(move |conn| fetch_rule(conn, id)).await
    }

    async fn create_rule(&self, draft: RuleDraft) -> StorageResult<AutomationRule> {
        self.with_conn(move |conn| {
            let mut rule = draft.into_rule(0, Utc::now());
            conn.execute(
                "INSERT INTO automation_rules
                    (name, description, script_type, script_path, default_arguments,
                     trigger_condition, anomaly_threshold, downtime_threshold, is_active,
                     created_at, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    rule.name,
                    rule.description,
                    rule.script_type,
                    rule.script_path,
                    rule.default_arguments,
                    rule.trigger_condition.as_str(),
                    rule.anomaly_threshold,
                    rule.downtime_threshold,
                    rule.is_active,
                    fmt_ts(&rule.created_at),
                    rule.notes,
                ],
            )?;
            rule.id = conn.last_insert_rowid();
            Ok(rule)
        })
        .await
    }

    async fn update_rule(&self, id: RuleId, draft: RuleDraft) -> StorageResult<AutomationRule> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = fetch_rule(&tx, id)?;
            let updated = draft.apply_to(&existing);
            write_rule(&tx, &updated)?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    async fn delete_rule(&self, id: RuleId) -> StorageResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM automation_rules WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StorageError::NotFound { entity: "rule", id });
            }
            Ok(())
        })
        .await
    }

    async fn record_completion(
        &self,
        id: RuleId,
        success: bool,
        duration: Duration,
        finished_at: DateTime<Utc>,
    ) -> StorageResult<RuleStats> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut rule = fetch_rule(&tx, id)?;
            rule.stats.record(success, duration, finished_at);
            write_rule(&tx, &rule)?;
            tx.commit()?;
            Ok(rule.stats)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ExecutionLedger for SqliteStore {
    /// References deleted since the snapshot was taken are stored as NULL.
    async fn begin_execution(&self, new: NewExecution) -> StorageResult<ExecutionRecord> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO script_executions
                    (rule_id, script_name, script_type, script_path, arguments, trigger_type,
                     site_id, outcome_id, status, started_at)
                 VALUES ((SELECT id FROM automation_rules WHERE id = ?1), ?2, ?3, ?4, ?5, ?6,
                         (SELECT id FROM sites WHERE id = ?7),
                         (SELECT id FROM probe_outcomes WHERE id = ?8), ?9, ?10)",
                params![
                    new.rule_id,
                    new.script_name,
                    new.script_type,
                    new.script_path,
                    new.arguments,
                    new.trigger_type.as_str(),
                    new.site_id,
                    new.outcome_id,
                    ExecutionStatus::Running.as_str(),
                    fmt_ts(&new.started_at),
                ],
            )?;
            fetch_execution(conn, conn.last_insert_rowid())
        })
        .await
    }

    async fn finish_execution(&self, id: ExecutionId, completion: Completion) -> StorageResult<ExecutionRecord> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE script_executions SET
                    status = ?2, exit_code = ?3, output = ?4, error_output = ?5,
                    duration_ms = ?6, error_message = ?7, finished_at = ?8
                 WHERE id = ?1 AND status = 'running'",
                params![
                    id,
                    completion.status.as_str(),
                    completion.exit_code,
                    completion.output,
                    completion.error_output,
                    opt_i64(Some(completion.duration_ms)),
                    completion.error_message,
                    fmt_ts(&completion.finished_at),
                ],
            )?;
            let record = fetch_execution(conn, id)?;
            if changed == 0 {
                return Err(StorageError::AlreadyFinalized(id));
            }
            Ok(record)
        })
        .await
    }

    async fn get_execution(&self, id: ExecutionId) -> StorageResult<ExecutionRecord> {
        self.with_conn(move |conn| fetch_execution(conn, id)).await
    }

    async fn recent_executions(&self, limit: usize, site_id: Option<SiteId>) -> StorageResult<Vec<ExecutionRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            collect(
                conn,
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM script_executions
                     WHERE (?1 IS NULL OR site_id = ?1)
                     ORDER BY started_at DESC, id DESC
                     LIMIT ?2"
                ),
                params![site_id, limit],
                execution_from_row,
            )
        })
        .await
    }

    async fn stale_executions(&self) -> StorageResult<Vec<ExecutionRecord>> {
        self.with_conn(|conn| {
            collect(
                conn,
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM script_executions
                     WHERE status = 'running'
                     ORDER BY started_at"
                ),
                [],
                execution_from_row,
            )
        })
        .await
    }
}
