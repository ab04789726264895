mod common;

use anyhow::Result;
use common::test_exchange;
use mutua::application::EngineError;
use mutua::domain::{Credits, TransactionKind};
use uuid::Uuid;

#[tokio::test]
async fn test_unknown_user_has_zero_balance() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;

    let stranger = Uuid::new_v4();
    let balance = ex.engine.get_balance(stranger).await?;
    assert_eq!(balance.user_id, stranger);
    assert_eq!((balance.available, balance.reserved), (0, 0));

    // Reading a balance never creates one
    assert!(ex.engine.list_balances().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_grant_is_idempotent_per_key() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let user = ex.members.requester;

    let first = ledger.grant(user, 1000, "welcome").await?;
    let second = ledger.grant(user, 1000, "welcome").await?;
    assert_eq!(first.id, second.id);
    assert_eq!(first.sequence, second.sequence);

    assert_eq!(ledger.balance(user).await?.available, 1000);
    assert_eq!(ledger.transactions(Some(user)).await?.len(), 1);

    let err = ledger.grant(user, 2500, "welcome").await.unwrap_err();
    assert!(matches!(err, EngineError::IdempotencyKeyReused { .. }));
    assert_eq!(ledger.balance(user).await?.available, 1000);
    Ok(())
}

#[tokio::test]
async fn test_reserve_requires_available_credits() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let user = ex.members.requester;

    ledger.grant(user, 300, "g1").await?;
    let err = ledger.reserve(user, 500, None, "r1").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientCredits {
            available: 300,
            required: 500,
            ..
        }
    ));

    let balance = ledger.balance(user).await?;
    assert_eq!((balance.available, balance.reserved), (300, 0));
    assert_eq!(ledger.transactions(None).await?.len(), 1);

    let record = ledger.reserve(user, 300, None, "r2").await?;
    assert_eq!(record.kind, TransactionKind::Reserve);
    assert_eq!(record.from_user, Some(user));
    assert_eq!(record.to_user, user);
    let balance = ledger.balance(user).await?;
    assert_eq!((balance.available, balance.reserved), (0, 300));
    Ok(())
}

#[tokio::test]
async fn test_release_and_refund_cannot_exceed_reservation() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let user = ex.members.requester;

    ledger.grant(user, 1000, "g1").await?;
    ledger.reserve(user, 400, None, "r1").await?;

    let err = ledger.release(user, 500, None, "rel1").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidReservation {
            reserved: 400,
            required: 500,
            ..
        }
    ));

    ledger.release(user, 150, None, "rel2").await?;
    ledger.refund(user, 250, None, "ref1").await?;

    let balance = ledger.balance(user).await?;
    assert_eq!((balance.available, balance.reserved), (1000, 0));
    assert!(matches!(
        ledger.refund(user, 1, None, "ref2").await,
        Err(EngineError::InvalidReservation { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_transfer_preserves_total_credits() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let (a, b) = (ex.members.requester, ex.members.provider);

    ledger.grant(a, 1000, "g1").await?;
    ledger.grant(b, 200, "g2").await?;
    ledger.reserve(a, 400, None, "r1").await?;

    let before = ledger.balance(a).await?.total() + ledger.balance(b).await?.total();
    let record = ledger.transfer(a, b, 400, None, "t1").await?;
    let after = ledger.balance(a).await?.total() + ledger.balance(b).await?.total();

    assert_eq!(before, after);
    assert_eq!(record.kind, TransactionKind::Transfer);
    assert_eq!((record.from_user, record.to_user), (Some(a), b));

    let payer = ledger.balance(a).await?;
    let payee = ledger.balance(b).await?;
    assert_eq!((payer.available, payer.reserved), (600, 0));
    assert_eq!((payee.available, payee.reserved), (600, 0));
    Ok(())
}

#[tokio::test]
async fn test_transfer_needs_reserved_credits() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let (a, b) = (ex.members.requester, ex.members.provider);

    ledger.grant(a, 1000, "g1").await?;
    let err = ledger.transfer(a, b, 100, None, "t1").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidReservation { .. }));

    assert_eq!(ledger.balance(b).await?.available, 0);
    assert_eq!(ledger.transactions(None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_rejects_non_positive_amounts_and_self_transfer() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let a = ex.members.requester;

    assert!(matches!(
        ledger.grant(a, 0, "g0").await,
        Err(EngineError::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger.reserve(a, -5, None, "r0").await,
        Err(EngineError::InvalidAmount(_))
    ));

    ledger.grant(a, 100, "g1").await?;
    ledger.reserve(a, 100, None, "r1").await?;
    assert!(matches!(
        ledger.transfer(a, a, 100, None, "t1").await,
        Err(EngineError::InvalidAmount(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_grants_cannot_exceed_credit_supply() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let (a, b) = (ex.members.requester, ex.members.provider);

    ledger.grant(a, Credits::MAX - 100, "g1").await?;
    let err = ledger.grant(b, 101, "g2").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidAmount(_)));
    ledger.grant(b, 100, "g3").await?;

    assert_eq!(ledger.balance(a).await?.available, Credits::MAX - 100);
    assert_eq!(ledger.balance(b).await?.available, 100);
    assert_eq!(ledger.transactions(None).await?.len(), 2);

    let report = ex.engine.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.total_granted, Credits::MAX);
    Ok(())
}

#[tokio::test]
async fn test_sequences_are_gap_free() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let a = ex.members.requester;

    ledger.grant(a, 1000, "g1").await?;
    // Failed operations do not consume a sequence number
    let _ = ledger.reserve(a, 5000, None, "r-too-much").await;
    ledger.reserve(a, 500, None, "r1").await?;
    ledger.release(a, 500, None, "rel1").await?;

    let sequences: Vec<i64> = ledger
        .transactions(None)
        .await?
        .iter()
        .map(|r| r.sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn test_integrity_flags_reservation_without_request() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let ledger = ex.engine.ledger();
    let a = ex.members.requester;

    ledger.grant(a, 1000, "g1").await?;
    let report = ex.engine.check_integrity().await?;
    assert!(report.is_healthy());
    assert_eq!(report.total_granted, 1000);

    ledger.reserve(a, 300, None, "orphan").await?;
    let report = ex.engine.check_integrity().await?;
    assert!(!report.is_healthy());
    assert!(report.issues.iter().any(|i| i.contains("open requests hold")));
    Ok(())
}
