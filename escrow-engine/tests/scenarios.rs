//! End-to-end trades between one maker and one taker

mod common;

use common::*;
use escrow_core::EscrowError;
use escrow_engine::EscrowStatus;

const DAY: i64 = 86_400;

#[tokio::test]
async fn taker_completes_trade_before_expiry() -> anyhow::Result<()> {
    let env = setup(16).await?;
    let made = env.node.make(env.request(1, 100, 50, START + 10 * DAY)).await?;

    env.node.take(&env.taker, &made.escrow).await?;

    assert_eq!(env.balance(&env.taker, &env.mint_a).await?, 100);
    assert_eq!(env.balance(&env.maker, &env.mint_b).await?, 50);
    assert!(env.ledger.account(&made.escrow).await.is_none());
    assert!(env.ledger.account(&made.vault).await.is_none());
    Ok(())
}

#[tokio::test]
async fn anyone_refunds_an_already_expired_escrow() -> anyhow::Result<()> {
    let env = setup(16).await?;
    let made = env.node.make(env.request(2, 50, 10, START - 100)).await?;
    let before = env.balance(&env.maker, &env.mint_a).await?;

    // No signer: the node submits the refund on nobody's behalf
    env.node.refund(&made.escrow).await?;

    assert_eq!(env.balance(&env.maker, &env.mint_a).await?, before + 50);
    assert!(env.ledger.account(&made.escrow).await.is_none());
    assert!(env.ledger.account(&made.vault).await.is_none());

    // The orphaned refund task ages from when it was queued, not from expiry
    let err = env
        .queue_client
        .reclaim(&env.queue, made.task_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::StaleThresholdNotReached { age: 0, .. }));
    assert!(env.slot_is_set(made.task_id).await?);
    Ok(())
}

#[tokio::test]
async fn immediate_refund_of_live_escrow_is_refused() -> anyhow::Result<()> {
    let env = setup(16).await?;
    let made = env.node.make(env.request(3, 50, 10, START + DAY)).await?;

    let err = env.node.refund(&made.escrow).await.unwrap_err();
    assert!(matches!(err, EscrowError::RefundNotYetAllowed { .. }));

    let info = env.node.escrow_info(&made.escrow).await?;
    assert_eq!(info.status, EscrowStatus::Active);
    assert_eq!(info.vault_balance, 50);
    Ok(())
}
