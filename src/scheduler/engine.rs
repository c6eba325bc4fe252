use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{CycleError, Scheduler};

/// Main scheduler loop. Runs one cycle per interval boundary until `cancel` fires.
pub async fn run_scheduler_loop(scheduler: Scheduler, cancel: CancellationToken) {
    let period = scheduler.config().poll_interval();
    info!(interval_secs = period.as_secs(), "Scheduler engine started");

    let mut interval = tokio::time::interval(period);
    // A cycle longer than the interval shifts later boundaries instead of bursting.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match scheduler.run_cycle(&cancel).await {
            Ok(report) => info!(
                cycle = %report.cycle_id,
                sites = report.sites,
                persisted = report.outcomes.len(),
                persist_failures = report.persist_failures,
                spawned = report.spawned,
                pruned = report.pruned,
                "Cycle complete"
            ),
            Err(CycleError::Cancelled) => break,
            Err(e) => error!(error = %e, "Cycle aborted, retrying next interval"),
        }
    }

    info!("Scheduler engine stopped");
}
