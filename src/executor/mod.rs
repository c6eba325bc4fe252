//! Remediation script execution.
//!
//! Each attempt is recorded as `running` before the process starts and is
//! finalized exactly once, whatever happens to the process. Rule statistics
//! are updated under a per-rule lock, and at most one attempt per
//! (rule, site) pair is in flight; extra triggers are dropped.

pub mod command;
pub mod record;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use self::command::CommandLine;
use self::record::{Completion, ExecutionId, ExecutionRecord, ExecutionStatus, NewExecution, TriggerContext};
use crate::rules::{AutomationRule, RuleError, RuleId};
use crate::sites::SiteId;
use crate::storage::{ExecutionLedger, RuleStore, StorageError};

/// Per-stream capture limit.
const OUTPUT_CAP: usize = 64 * 1024;

/// How long to wait for output readers once the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("script not found: {}", .0.display())]
    MissingScript(PathBuf),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for script: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Script execution timed out after {0} seconds")]
    TimedOut(u64),

    #[error("Script execution cancelled by shutdown")]
    Cancelled,

    #[error("rule {rule_id} is already running for site {site_id:?}")]
    AlreadyRunning { rule_id: RuleId, site_id: Option<SiteId> },

    #[error("rule {0} is not active")]
    Inactive(RuleId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

type ClaimKey = (RuleId, Option<SiteId>);

struct Inner {
    rules: Arc<dyn RuleStore>,
    ledger: Arc<dyn ExecutionLedger>,
    scripts_root: PathBuf,
    timeout: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    in_flight: Mutex<HashSet<ClaimKey>>,
    stats_locks: Mutex<HashMap<RuleId, Arc<tokio::sync::Mutex<()>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held while an attempt for a (rule, site) pair is in flight.
struct Claim {
    key: ClaimKey,
    inner: Arc<Inner>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.key);
    }
}

#[derive(Clone)]
pub struct ScriptExecutor {
    inner: Arc<Inner>,
}

impl ScriptExecutor {
    pub fn new<S>(store: Arc<S>, scripts_root: PathBuf, timeout: Duration, shutdown: CancellationToken) -> Self
    where
        S: RuleStore + ExecutionLedger + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                rules: store.clone(),
                ledger: store,
                scripts_root,
                timeout,
                shutdown,
                tracker: TaskTracker::new(),
                in_flight: Mutex::new(HashSet::new()),
                stats_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn scripts_root(&self) -> &Path {
        &self.inner.scripts_root
    }

    /// Number of (rule, site) pairs currently executing.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    fn try_claim(&self, rule_id: RuleId, site_id: Option<SiteId>) -> Option<Claim> {
        let key = (rule_id, site_id);
        if !lock(&self.inner.in_flight).insert(key) {
            return None;
        }
        Some(Claim {
            key,
            inner: self.inner.clone(),
        })
    }

    /// Launch in the background. Returns `false` when the trigger was dropped
    /// because the same rule is still running for the same site.
    pub fn spawn(&self, rule: AutomationRule, ctx: TriggerContext) -> bool {
        let Some(claim) = self.try_claim(rule.id, ctx.site_id) else {
            warn!(rule_id = rule.id, site_id = ?ctx.site_id, trigger = %ctx.trigger, "Rule already running for site, trigger dropped");
            return false;
        };

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            let _claim = claim;
            match this.run(&rule, ctx).await {
                Ok(record) => {
                    info!(rule_id = rule.id, execution_id = record.id, status = %record.status, "Remediation finished");
                }
                Err(e) => {
                    error!(rule_id = rule.id, error = %e, "Remediation could not be recorded");
                }
            }
        });
        true
    }

    /// Run to completion and return the finalized record (manual trigger).
    pub async fn execute(&self, rule: &AutomationRule, ctx: TriggerContext) -> Result<ExecutionRecord, ExecError> {
        if !rule.is_active {
            return Err(ExecError::Inactive(rule.id));
        }
        let _claim = self
            .try_claim(rule.id, ctx.site_id)
            .ok_or(ExecError::AlreadyRunning {
                rule_id: rule.id,
                site_id: ctx.site_id,
            })?;
        self.run(rule, ctx).await
    }

    /// Wait for every background execution spawned so far.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    async fn run(&self, rule: &AutomationRule, ctx: TriggerContext) -> Result<ExecutionRecord, ExecError> {
        let new = NewExecution::snapshot(rule, &ctx, Utc::now());
        let arguments = new.arguments.clone();
        let record = self.inner.ledger.begin_execution(new).await?;

        info!(
            rule_id = rule.id,
            execution_id = record.id,
            script = %rule.name,
            trigger = %ctx.trigger,
            site_id = ?ctx.site_id,
            "Executing remediation script"
        );

        let started = Instant::now();
        let report = self.invoke(rule, arguments.as_deref(), record.id).await;
        let duration = started.elapsed();

        let completion = report.into_completion(duration);
        let success = completion.succeeded();

        // Both steps run even if the first fails.
        let finished = self.inner.ledger.finish_execution(record.id, completion).await;
        self.update_stats(rule.id, success, duration).await;

        Ok(finished?)
    }

    async fn update_stats(&self, rule_id: RuleId, success: bool, duration: Duration) {
        let rule_lock = lock(&self.inner.stats_locks)
            .entry(rule_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = rule_lock.lock().await;

        match self
            .inner
            .rules
            .record_completion(rule_id, success, duration, Utc::now())
            .await
        {
            Ok(stats) => debug!(
                rule_id,
                executions = stats.execution_count,
                avg_ms = ?stats.average_duration_ms,
                "Rule statistics updated"
            ),
            Err(e) if e.is_not_found() => {
                warn!(rule_id, "Rule deleted while executing; statistics not updated");
            }
            Err(e) => error!(rule_id, error = %e, "Failed to update rule statistics"),
        }
    }

    async fn invoke(&self, rule: &AutomationRule, arguments: Option<&str>, execution_id: ExecutionId) -> RunReport {
        let kind = match rule.script_kind() {
            Ok(kind) => kind,
            Err(e) => return RunReport::rejected(e.into()),
        };

        let script = self.inner.scripts_root.join(&rule.script_path);
        let is_file = tokio::fs::metadata(&script)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return RunReport::rejected(ExecError::MissingScript(script));
        }

        let line = CommandLine::resolve(kind, &rule.script_path, arguments);
        let mut child = match line.command(&self.inner.scripts_root).spawn() {
            Ok(child) => child,
            Err(source) => {
                return RunReport::rejected(ExecError::Spawn {
                    program: line.program,
                    source,
                })
            }
        };

        let stdout = Captured::default();
        let stderr = Captured::default();
        let readers = [
            capture(child.stdout.take(), stdout.clone(), execution_id, false),
            capture(child.stderr.take(), stderr.clone(), execution_id, true),
        ];

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(self.inner.timeout) => Waited::TimedOut,
            _ = self.inner.shutdown.cancelled() => Waited::Cancelled,
        };

        let (exit_code, failure) = match waited {
            Waited::Exited(Ok(status)) => (exit_code(status), None),
            Waited::Exited(Err(e)) => (None, Some(ExecError::Wait(e))),
            Waited::TimedOut => {
                error!(execution_id, timeout_secs = self.inner.timeout.as_secs(), "Script execution timed out");
                kill(&mut child, execution_id).await;
                (None, Some(ExecError::TimedOut(self.inner.timeout.as_secs())))
            }
            Waited::Cancelled => {
                warn!(execution_id, "Shutdown requested, killing script");
                kill(&mut child, execution_id).await;
                (None, Some(ExecError::Cancelled))
            }
        };

        for mut reader in readers {
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        RunReport {
            exit_code,
            output: stdout.take(),
            error_output: stderr.take(),
            failure,
        }
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

async fn kill(child: &mut tokio::process::Child, execution_id: ExecutionId) {
    if let Err(e) = child.kill().await {
        warn!(execution_id, error = %e, "Failed to kill script process");
    }
}

/// What happened to one process run.
struct RunReport {
    exit_code: Option<i32>,
    output: String,
    error_output: String,
    failure: Option<ExecError>,
}

impl RunReport {
    /// Rejected before a process was started.
    fn rejected(failure: ExecError) -> Self {
        warn!(error = %failure, "Script execution rejected");
        Self {
            exit_code: None,
            output: String::new(),
            error_output: String::new(),
            failure: Some(failure),
        }
    }

    fn into_completion(self, duration: Duration) -> Completion {
        let success = self.failure.is_none() && self.exit_code == Some(0);
        let error_message = match (&self.failure, success) {
            (Some(failure), _) => Some(failure.to_string()),
            (None, true) => None,
            (None, false) => {
                let stderr = self.error_output.trim();
                if stderr.is_empty() {
                    Some(match self.exit_code {
                        Some(code) => format!("Script exited with code {code}"),
                        None => "Script terminated by signal".to_string(),
                    })
                } else {
                    Some(stderr.to_string())
                }
            }
        };

        Completion {
            status: if success {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            },
            exit_code: self.exit_code,
            output: self.output,
            error_output: self.error_output,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            error_message,
            finished_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct CaptureBuf {
    text: String,
    truncated: bool,
}

/// Bounded, shareable output buffer filled line by line.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<CaptureBuf>>);

impl Captured {
    fn push_line(&self, line: &str) {
        let mut buf = lock(&self.0);
        if buf.truncated {
            return;
        }
        if buf.text.len() + line.len() + 1 > OUTPUT_CAP {
            buf.text.push_str("[output truncated]\n");
            buf.truncated = true;
            return;
        }
        buf.text.push_str(line);
        buf.text.push('\n');
    }

    fn take(&self) -> String {
        std::mem::take(&mut lock(&self.0).text)
    }
}

fn capture<R>(stream: Option<R>, sink: Captured, execution_id: ExecutionId, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return;
        };
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if line.is_empty() {
                        continue;
                    }
                    if is_stderr {
                        warn!(execution_id, "Script error: {}", line);
                    } else {
                        info!(execution_id, "Script output: {}", line);
                    }
                    sink.push_line(line);
                }
                Err(e) => {
                    debug!(execution_id, error = %e, "Script output stream closed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_is_bounded() {
        let captured = Captured::default();
        let line = "x".repeat(1024);
        for _ in 0..100 {
            captured.push_line(&line);
        }
        let text = captured.take();
        assert!(text.len() <= OUTPUT_CAP + 32);
        assert!(text.ends_with("[output truncated]\n"));
    }

    #[test]
    fn test_nonzero_exit_uses_stderr_as_message() {
        let report = RunReport {
            exit_code: Some(2),
            output: String::new(),
            error_output: "service not found\n".to_string(),
            failure: None,
        };
        let completion = report.into_completion(Duration::from_millis(5));
        assert_eq!(completion.status, ExecutionStatus::Failed);
        assert_eq!(completion.error_message.as_deref(), Some("service not found"));
    }

    #[test]
    fn test_nonzero_exit_without_stderr() {
        let report = RunReport {
            exit_code: Some(4),
            output: String::new(),
            error_output: String::new(),
            failure: None,
        };
        let completion = report.into_completion(Duration::from_millis(5));
        assert_eq!(completion.error_message.as_deref(), Some("Script exited with code 4"));
    }

    #[test]
    fn test_timeout_message() {
        let report = RunReport {
            exit_code: None,
            output: String::new(),
            error_output: String::new(),
            failure: Some(ExecError::TimedOut(300)),
        };
        let completion = report.into_completion(Duration::from_secs(300));
        assert_eq!(completion.status, ExecutionStatus::Failed);
        assert_eq!(
            completion.error_message.as_deref(),
            Some("Script execution timed out after 300 seconds")
        );
        assert_eq!(completion.duration_ms, 300_000);
    }

    #[test]
    fn test_clean_exit_is_success() {
        let report = RunReport {
            exit_code: Some(0),
            output: "ok\n".to_string(),
            error_output: String::new(),
            failure: None,
        };
        let completion = report.into_completion(Duration::from_millis(1));
        assert!(completion.succeeded());
        assert!(completion.error_message.is_none());
    }
}
