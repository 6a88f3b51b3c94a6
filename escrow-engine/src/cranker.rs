//! Cranker - executes eligible tasks on a task queue
//!
//! Scans the queue bitmap, runs tasks whose trigger has matured and
//! reclaims tasks that keep failing once they pass the stale threshold.

use crate::telemetry;
use escrow_core::{EscrowError, EscrowResult, Pubkey, Recovery};
use escrow_queue::TaskQueueClient;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

/// Cranker configuration
#[derive(Debug, Clone)]
pub struct CrankerConfig {
    pub task_queue: Pubkey,
    /// Receives crank rewards; must sign the crank transactions
    pub crank_turner: Pubkey,
    pub poll_interval: Duration,
    /// Eligible tasks attempted per pass
    pub batch_size: usize,
}

impl CrankerConfig {
    pub fn new(task_queue: Pubkey, crank_turner: Pubkey) -> Self {
        Self {
            task_queue,
            crank_turner,
            poll_interval: Duration::from_secs(1),
            batch_size: 32,
        }
    }
}

/// Result of examining one task slot
#[derive(Debug, Clone, PartialEq)]
pub enum CrankOutcome {
    Executed { task_id: u16, receipt_id: Uuid },
    Pending { task_id: u16, eligible_at: i64 },
    Failed { task_id: u16, error: EscrowError },
    Reclaimed { task_id: u16 },
}

pub struct Cranker {
    client: TaskQueueClient,
    config: CrankerConfig,
    /// Slot the next pass starts from
    cursor: AtomicUsize,
}

impl Cranker {
    pub fn new(client: TaskQueueClient, config: CrankerConfig) -> Self {
        Self {
            client,
            config,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &CrankerConfig {
        &self.config
    }

    /// One pass over the occupied slots.
    ///
    /// Every occupied slot is inspected; tasks whose trigger has not matured
    /// are reported as pending and do not count against `batch_size`. The
    /// next pass resumes after the last slot attempted, so tasks that keep
    /// failing cannot starve the slots behind them.
    pub async fn crank_once(&self) -> EscrowResult<Vec<CrankOutcome>> {
        let queue = &self.config.task_queue;
        let snapshot = self.client.fetch_queue(queue).await?;
        let now = self.client.ledger().unix_timestamp().await;
        let stale_after = i64::from(snapshot.stale_task_age);

        let start = self.cursor.load(Ordering::Relaxed);
        let (behind, ahead): (Vec<u16>, Vec<u16>) = snapshot
            .bitmap
            .occupied_ids()
            .partition(|id| usize::from(*id) < start);

        let mut outcomes = Vec::new();
        let mut attempted = 0;
        for task_id in ahead.into_iter().chain(behind) {
            if attempted >= self.config.batch_size {
                break;
            }
            // The bit can outlive a concurrent crank between snapshot and fetch
            let Some(task) = self.client.fetch_task_by_id(queue, task_id).await? else {
                continue;
            };

            let outcome = if !task.is_eligible(now) {
                CrankOutcome::Pending {
                    task_id,
                    eligible_at: task.eligible_at(),
                }
            } else {
                attempted += 1;
                self.cursor.store(usize::from(task_id) + 1, Ordering::Relaxed);
                match self
                    .client
                    .crank(queue, task_id, &self.config.crank_turner)
                    .await
                {
                    Ok(receipt) => CrankOutcome::Executed {
                        task_id,
                        receipt_id: receipt.id,
                    },
                    // Payload can never succeed; free the slot once it is stale
                    Err(err)
                        if err.recovery() == Recovery::ReclaimWhenStale
                            && task.age(now) >= stale_after =>
                    {
                        self.reclaim(task_id).await
                    }
                    Err(err) => CrankOutcome::Failed {
                        task_id,
                        error: err,
                    },
                }
            };

            telemetry::crank_outcome(queue, &outcome);
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Free a stale slot; a failure is reported without ending the pass
    async fn reclaim(&self, task_id: u16) -> CrankOutcome {
        match self.client.reclaim(&self.config.task_queue, task_id).await {
            Ok(_) => CrankOutcome::Reclaimed { task_id },
            Err(error) => CrankOutcome::Failed { task_id, error },
        }
    }

    /// Crank on every tick until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> EscrowResult<()> {
        info!(
            "Starting cranker on queue {} every {:?}",
            self.config.task_queue, self.config.poll_interval
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.crank_once().await {
                        error!("Crank pass failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Cranker shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}
