//! Crash recovery
//!
//! Reconciles runs against queue entries after a restart. Runs whose queue
//! entry is still live are left alone - the queue manager re-dispatches
//! them and the engine resumes from the latest stage snapshot. Runs with
//! no live queue entry are stranded and marked failed.

use tracing::{info, warn};

use crate::domain::RunStatus;

use super::StateManager;

/// Recovery statistics
#[derive(Debug, Default)]
pub struct RecoveryStats {
    /// Runs left for the queue manager to resume
    pub runs_resumable: usize,
    /// Runs marked failed because nothing will re-dispatch them
    pub runs_stranded: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "resumable: {}, stranded: {}",
            self.runs_resumable, self.runs_stranded
        )
    }
}

/// Reconcile active runs against live queue entries
pub async fn recover(state: &StateManager) -> eyre::Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    let live_entries = state
        .list_queue_entries(None, None)
        .await
        .map_err(|e| eyre::eyre!("Failed to list queue entries: {}", e))?;
    let live_run_ids: Vec<String> = live_entries
        .iter()
        .filter(|e| !e.is_terminal())
        .filter_map(|e| e.run_id.clone())
        .collect();

    let mut active = state
        .list_runs(None, Some("running".to_string()))
        .await
        .map_err(|e| eyre::eyre!("Failed to list running runs: {}", e))?;
    let waiting = state
        .list_runs(None, Some("waiting_validation".to_string()))
        .await
        .map_err(|e| eyre::eyre!("Failed to list waiting runs: {}", e))?;
    active.extend(waiting);

    for mut run in active {
        if live_run_ids.contains(&run.id) {
            stats.runs_resumable += 1;
            continue;
        }

        warn!(run_id = %run.id, status = %run.status, "Stranded run found during recovery, marking failed");
        run.set_error("Recovered from crash - no live queue entry to resume from");
        run.set_status(RunStatus::Failed);
        state
            .update_run(run)
            .await
            .map_err(|e| eyre::eyre!("Failed to update stranded run: {}", e))?;
        stats.runs_stranded += 1;
    }

    if stats.runs_resumable > 0 || stats.runs_stranded > 0 {
        info!("Crash recovery complete: {}", stats);
    }
    Ok(stats)
}
