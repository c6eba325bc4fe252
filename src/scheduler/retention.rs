//! Retention sweep for probe outcomes.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::storage::{ProbeLedger, StorageResult};

/// Delete outcomes checked before `now - window`. Returns the number removed.
/// A window reaching past the earliest representable time keeps everything.
pub async fn sweep(ledger: &dyn ProbeLedger, now: DateTime<Utc>, window: Duration) -> StorageResult<usize> {
    let Some(cutoff) = now.checked_sub_signed(window) else {
        return Ok(0);
    };
    let removed = ledger.delete_older_than(cutoff).await?;
    if removed > 0 {
        info!(removed, %cutoff, "Pruned expired probe outcomes");
    }
    Ok(removed)
}
