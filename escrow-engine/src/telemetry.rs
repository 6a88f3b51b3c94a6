//! Tracing setup and structured events for escrow and crank activity

use crate::cranker::CrankOutcome;
use escrow_core::{EscrowError, EscrowResult, Pubkey};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(default_filter: &str) -> EscrowResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| EscrowError::config(format!("invalid log filter {default_filter:?}: {e}")))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| EscrowError::internal(format!("tracing already initialized: {e}")))
}

/// Record a new escrow and its refund slot
pub fn escrow_made(escrow: &Pubkey, task_queue: &Pubkey, task_id: u16, expiry: i64) {
    info!(
        target: "escrow_made",
        escrow = %escrow,
        task_queue = %task_queue,
        task_id = task_id,
        expiry = expiry,
    );
}

/// Record the result of a single crank attempt
pub fn crank_outcome(task_queue: &Pubkey, outcome: &CrankOutcome) {
    match outcome {
        CrankOutcome::Executed {
            task_id,
            receipt_id,
        } => info!(
            target: "crank",
            task_queue = %task_queue,
            task_id = *task_id,
            receipt = %receipt_id,
            result = "executed",
        ),
        CrankOutcome::Pending {
            task_id,
            eligible_at,
        } => debug!(
            target: "crank",
            task_queue = %task_queue,
            task_id = *task_id,
            eligible_at = *eligible_at,
            result = "pending",
        ),
        CrankOutcome::Failed { task_id, error } => warn!(
            target: "crank",
            task_queue = %task_queue,
            task_id = *task_id,
            error = %error,
            recovery = ?error.recovery(),
            result = "failed",
        ),
        CrankOutcome::Reclaimed { task_id } => warn!(
            target: "crank",
            task_queue = %task_queue,
            task_id = *task_id,
            result = "reclaimed",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_a_config_error() {
        // Only reached when RUST_LOG is unset or unparsable
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        match init_tracing("escrow=notalevel") {
            Err(EscrowError::Config(msg)) => assert!(msg.contains("invalid log filter")),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }
}
