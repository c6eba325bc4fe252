//! SQLite store against temporary database files.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use smartuptime::executor::record::{Completion, ExecutionStatus, NewExecution, TriggerContext};
use smartuptime::executor::ScriptExecutor;
use smartuptime::probes::NewOutcome;
use smartuptime::rules::{RuleDraft, TriggerCondition, TriggerType};
use smartuptime::sites::SiteDraft;
use smartuptime::storage::{
    seed_default_rules, ExecutionLedger, ProbeLedger, RuleStore, SiteRegistry, SqliteStore, StorageError,
};

fn open(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(&dir.path().join("test.db")).unwrap()
}

fn outcome(site_id: i64, minutes_ago: i64, status_code: u16) -> NewOutcome {
    NewOutcome {
        site_id,
        checked_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        latency_ms: Some(120),
        status_code,
        is_anomaly: false,
        error_message: None,
    }
}

fn draft(name: &str) -> RuleDraft {
    RuleDraft {
        name: name.to_string(),
        description: "restart the web server".to_string(),
        script_type: "Bash".to_string(),
        script_path: "restart_service.sh".to_string(),
        default_arguments: Some("nginx".to_string()),
        trigger_condition: TriggerCondition::Downtime,
        anomaly_threshold: 1,
        downtime_threshold: 2,
        is_active: true,
        notes: None,
        reset_stats: false,
    }
}

fn completion(status: ExecutionStatus) -> Completion {
    Completion {
        status,
        exit_code: Some(0),
        output: "ok\n".to_string(),
        error_output: String::new(),
        duration_ms: 42,
        error_message: None,
        finished_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_sites_round_trip_and_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir);
        let site = store
            .add_site(SiteDraft::new("https://example.com").named("example"))
            .await
            .unwrap();
        assert_eq!(site.id, 1);
        store.add_site(SiteDraft::new("https://other.example.com")).await.unwrap();
        store.deactivate_site(2).await.unwrap();
    }

    let store = open(&dir);
    let all = store.list_sites().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].name.as_deref(), Some("example"));

    let active = store.list_active_sites().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].url, "https://example.com");

    let updated = store
        .update_site(2, SiteDraft::new("https://renamed.example.com"))
        .await
        .unwrap();
    assert!(updated.is_active);
    assert_eq!(updated.url, "https://renamed.example.com");

    assert!(store.get_site(99).await.unwrap_err().is_not_found());
    assert!(store.deactivate_site(99).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_recent_outcomes_are_newest_first_and_limited() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let site = store.add_site(SiteDraft::new("https://example.com")).await.unwrap();
    let other = store.add_site(SiteDraft::new("https://other.example.com")).await.unwrap();

    for (minutes_ago, status) in [(30, 200), (10, 503), (20, 500)] {
        store.append(outcome(site.id, minutes_ago, status)).await.unwrap();
    }
    store.append(outcome(other.id, 5, 200)).await.unwrap();

    let recent = store.recent_for_site(site.id, 2).await.unwrap();
    let statuses: Vec<u16> = recent.iter().map(|o| o.status_code).collect();
    assert_eq!(statuses, vec![503, 500]);

    let latest = store.latest_per_site().await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].site_id, site.id);
    assert_eq!(latest[0].status_code, 503);
    assert_eq!(latest[1].site_id, other.id);
}

#[tokio::test]
async fn test_append_for_unknown_site_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let err = store.append(outcome(42, 0, 200)).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { entity: "site", id: 42 }));
}

#[tokio::test]
async fn test_retention_boundary() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let site = store.add_site(SiteDraft::new("https://example.com")).await.unwrap();
    let now = Utc::now();

    let keep = now - ChronoDuration::days(6) - ChronoDuration::hours(23);
    let drop = now - ChronoDuration::days(7) - ChronoDuration::hours(1);
    for checked_at in [keep, drop] {
        store
            .append(NewOutcome {
                checked_at,
                ..outcome(site.id, 0, 200)
            })
            .await
            .unwrap();
    }

    let removed = store.delete_older_than(now - ChronoDuration::days(7)).await.unwrap();
    assert_eq!(removed, 1);
    let left = store.recent_for_site(site.id, 10).await.unwrap();
    assert_eq!(left.len(), 1);
    assert!(left[0].checked_at > now - ChronoDuration::days(7));
}

#[tokio::test]
async fn test_removing_site_cascades_outcomes_and_detaches_executions() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let site = store.add_site(SiteDraft::new("https://example.com")).await.unwrap();
    let rule = store.create_rule(draft("Restart nginx")).await.unwrap();
    let probe = store.append(outcome(site.id, 0, 503)).await.unwrap();

    let record = store
        .begin_execution(NewExecution {
            rule_id: rule.id,
            script_name: rule.name.clone(),
            script_type: rule.script_type.clone(),
            script_path: rule.script_path.clone(),
            arguments: rule.default_arguments.clone(),
            trigger_type: TriggerType::Downtime,
            site_id: Some(site.id),
            outcome_id: Some(probe.id),
            started_at: Utc::now(),
        })
        .await
        .unwrap();

    store.remove_site(site.id).await.unwrap();

    assert!(store.recent_for_site(site.id, 10).await.unwrap().is_empty());
    let kept = store.get_execution(record.id).await.unwrap();
    assert_eq!(kept.site_id, None);
    assert_eq!(kept.outcome_id, None);
    assert_eq!(kept.script_name, "Restart nginx");
    assert!(store.remove_site(site.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_rule_statistics_rolling_average() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let rule = store.create_rule(draft("Restart nginx")).await.unwrap();
    assert_eq!(rule.script_type, "bash");

    let now = Utc::now();
    store.record_completion(rule.id, true, Duration::from_millis(100), now).await.unwrap();
    let stats = store
        .record_completion(rule.id, false, Duration::from_millis(300), now)
        .await
        .unwrap();
    assert_eq!(stats.average_duration_ms, Some(200));

    let stats = store
        .record_completion(rule.id, true, Duration::from_millis(200), now)
        .await
        .unwrap();
    assert_eq!(stats.average_duration_ms, Some(200));
    assert_eq!(stats.execution_count, 3);
    assert_eq!(stats.success_count, 2);
    assert_eq!(stats.failure_count, 1);

    let stored = store.get_rule(rule.id).await.unwrap();
    assert_eq!(stored.stats.execution_count, 3);
    assert_eq!(stored.stats.average_duration_ms, Some(200));
    assert!(stored.stats.last_executed.is_some());
}

#[tokio::test]
async fn test_rule_edit_keeps_stats_unless_reset() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let rule = store.create_rule(draft("Restart nginx")).await.unwrap();
    // Re-read so timestamps carry stored precision.
    let rule = store.get_rule(rule.id).await.unwrap();
    store
        .record_completion(rule.id, true, Duration::from_millis(50), Utc::now())
        .await
        .unwrap();

    let edited = store
        .update_rule(
            rule.id,
            RuleDraft {
                downtime_threshold: 3,
                ..draft("Restart nginx harder")
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.name, "Restart nginx harder");
    assert_eq!(edited.downtime_threshold, 3);
    assert_eq!(edited.stats.execution_count, 1);
    assert_eq!(edited.created_at, rule.created_at);

    let reset = store
        .update_rule(
            rule.id,
            RuleDraft {
                reset_stats: true,
                ..draft("Restart nginx harder")
            },
        )
        .await
        .unwrap();
    assert_eq!(reset.stats.execution_count, 0);
    assert!(reset.stats.average_duration_ms.is_none());

    assert!(store.update_rule(999, draft("x")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_execution_finalized_exactly_once() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let rule = store.create_rule(draft("Restart nginx")).await.unwrap();

    let record = store
        .begin_execution(NewExecution {
            rule_id: rule.id,
            script_name: rule.name.clone(),
            script_type: rule.script_type.clone(),
            script_path: rule.script_path.clone(),
            arguments: None,
            trigger_type: TriggerType::Manual,
            site_id: None,
            outcome_id: None,
            started_at: Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(store.stale_executions().await.unwrap().len(), 1);

    let finished = store
        .finish_execution(record.id, completion(ExecutionStatus::Success))
        .await
        .unwrap();
    assert_eq!(finished.status, ExecutionStatus::Success);
    assert_eq!(finished.output.as_deref(), Some("ok\n"));
    assert_eq!(finished.duration_ms, Some(42));
    assert!(store.stale_executions().await.unwrap().is_empty());

    let again = store
        .finish_execution(record.id, completion(ExecutionStatus::Failed))
        .await
        .unwrap_err();
    assert!(matches!(again, StorageError::AlreadyFinalized(id) if id == record.id));
    assert_eq!(
        store.get_execution(record.id).await.unwrap().status,
        ExecutionStatus::Success
    );

    store.delete_rule(rule.id).await.unwrap();
    let orphaned = store.get_execution(record.id).await.unwrap();
    assert_eq!(orphaned.rule_id, None);
    assert_eq!(orphaned.script_name, "Restart nginx");
}

#[cfg(unix)]
#[tokio::test]
async fn test_deleted_rule_snapshot_still_records_execution() {
    let dir = TempDir::new().unwrap();
    let scripts = TempDir::new().unwrap();
    std::fs::write(scripts.path().join("restart_service.sh"), "echo \"restarting $1\"\n").unwrap();

    let store = Arc::new(open(&dir));
    let rule = store.create_rule(draft("Restart nginx")).await.unwrap();
    store.delete_rule(rule.id).await.unwrap();

    let executor = ScriptExecutor::new(
        store.clone(),
        scripts.path().to_path_buf(),
        Duration::from_secs(10),
        CancellationToken::new(),
    );
    let record = executor
        .execute(&rule, TriggerContext::manual(None, None))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.rule_id, None);
    assert_eq!(record.script_name, "Restart nginx");
    assert_eq!(record.output.as_deref(), Some("restarting nginx\n"));

    let history = store.recent_executions(10, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_begin_execution_detaches_removed_site_and_outcome() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let rule = store.create_rule(draft("Restart nginx")).await.unwrap();
    let site = store.add_site(SiteDraft::new("https://example.com")).await.unwrap();
    let down = store.append(outcome(site.id, 0, 503)).await.unwrap();
    store.remove_site(site.id).await.unwrap();

    let ctx = TriggerContext::automatic(TriggerType::Downtime, site.id, down.id);
    let record = store
        .begin_execution(NewExecution::snapshot(&rule, &ctx, Utc::now()))
        .await
        .unwrap();

    assert_eq!(record.rule_id, Some(rule.id));
    assert_eq!(record.site_id, None);
    assert_eq!(record.outcome_id, None);
    assert_eq!(record.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn test_recent_executions_filter_by_site() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let rule = store.create_rule(draft("Restart nginx")).await.unwrap();
    let a = store.add_site(SiteDraft::new("https://a.example.com")).await.unwrap();
    let b = store.add_site(SiteDraft::new("https://b.example.com")).await.unwrap();

    for (site, offset) in [(a.id, 3), (b.id, 2), (a.id, 1)] {
        store
            .begin_execution(NewExecution {
                rule_id: rule.id,
                script_name: rule.name.clone(),
                script_type: rule.script_type.clone(),
                script_path: rule.script_path.clone(),
                arguments: None,
                trigger_type: TriggerType::Downtime,
                site_id: Some(site),
                outcome_id: None,
                started_at: Utc::now() - ChronoDuration::seconds(offset),
            })
            .await
            .unwrap();
    }

    let all = store.recent_executions(10, None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].started_at >= w[1].started_at));

    let only_a = store.recent_executions(10, Some(a.id)).await.unwrap();
    assert_eq!(only_a.len(), 2);
    assert!(only_a.iter().all(|r| r.site_id == Some(a.id)));

    assert_eq!(store.recent_executions(1, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_default_rules_seeded_once() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    assert_eq!(seed_default_rules(&store).await.unwrap(), 3);
    assert_eq!(seed_default_rules(&store).await.unwrap(), 0);

    let rules = store.list_active_rules().await.unwrap();
    assert_eq!(rules.len(), 3);
    assert!(rules.iter().all(|r| r.downtime_threshold == 2));
    assert!(rules.iter().all(|r| r.trigger_condition == TriggerCondition::Downtime));
}
