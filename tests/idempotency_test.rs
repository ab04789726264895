mod common;

use anyhow::Result;
use common::{as_user, test_exchange};
use mutua::application::{CommandContext, EngineError};
use mutua::domain::{Actor, RequestState, TransactionKind};

#[tokio::test]
async fn test_replayed_create_returns_same_request() -> Result<()> {
    let (mut ex, _temp) = test_exchange().await?;
    let ctx = CommandContext::new("create-1", Actor::User(ex.members.requester));

    let first = ex
        .engine
        .create_request(&ctx, "tutoring", 300, None)
        .await?;
    let second = ex
        .engine
        .create_request(&ctx, "tutoring", 300, None)
        .await?;

    assert_eq!(first.id, second.id);
    assert_eq!(ex.engine.list_requests(None).await?.len(), 1);

    let created = ex
        .drain_events()
        .iter()
        .filter(|e| e.event_type == "request.created")
        .count();
    assert_eq!(created, 1);
    Ok(())
}

#[tokio::test]
async fn test_replayed_match_reserves_once() -> Result<()> {
    let (mut ex, _temp) = test_exchange().await?;
    let request = ex.funded_request(1000, 400).await?;
    ex.drain_events();

    let ctx = CommandContext::new("match-1", Actor::User(ex.members.requester));
    let first = ex
        .engine
        .match_request(&ctx, request.id, Some(ex.members.provider))
        .await?;
    let second = ex
        .engine
        .match_request(&ctx, request.id, Some(ex.members.provider))
        .await?;

    assert_eq!(first.id, second.id);
    assert_eq!(first.version, second.version);
    assert_eq!(second.state, RequestState::Matched);
    assert_eq!(second.provider_id, Some(ex.members.provider));
    let balance = ex.engine.get_balance(ex.members.requester).await?;
    assert_eq!((balance.available, balance.reserved), (600, 400));

    let reserves = ex
        .engine
        .list_transactions(None)
        .await?
        .iter()
        .filter(|r| r.kind == TransactionKind::Reserve)
        .count();
    assert_eq!(reserves, 1);
    assert_eq!(ex.drain_events().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_replay_returns_current_snapshot() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let request = ex.matched_request(1000, 400).await?;

    let accept = CommandContext::new("accept-1", Actor::User(ex.members.provider));
    ex.engine.accept_request(&accept, request.id).await?;
    ex.engine
        .start_request(&as_user(ex.members.provider), request.id)
        .await?;

    let replayed = ex.engine.accept_request(&accept, request.id).await?;
    assert_eq!(replayed.state, RequestState::InProgress);
    assert_eq!(replayed.history.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_replayed_complete_transfers_once() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let request = ex.request_in_progress(1000, 400).await?;

    let ctx = CommandContext::new("done-1", Actor::User(ex.members.requester));
    ex.engine.complete_request(&ctx, request.id).await?;
    let again = ex.engine.complete_request(&ctx, request.id).await?;
    assert_eq!(again.state, RequestState::Completed);

    assert_eq!(ex.engine.get_balance(ex.members.provider).await?.available, 400);
    let transfers = ex
        .engine
        .list_transactions(None)
        .await?
        .iter()
        .filter(|r| r.kind == TransactionKind::Transfer)
        .count();
    assert_eq!(transfers, 1);
    Ok(())
}

#[tokio::test]
async fn test_key_reused_for_other_command_is_rejected() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let request = ex.matched_request(1000, 400).await?;

    let ctx = CommandContext::new("shared", Actor::User(ex.members.provider));
    ex.engine.accept_request(&ctx, request.id).await?;

    let err = ex.engine.start_request(&ctx, request.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::IdempotencyKeyReused { ref key, ref command }
            if key == "shared" && command == "accept"
    ));
    assert_eq!(
        ex.engine.get_request(request.id).await?.state,
        RequestState::Accepted
    );
    Ok(())
}

#[tokio::test]
async fn test_key_reused_for_other_request_is_rejected() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let first = ex.funded_request(1000, 300).await?;
    let second = ex
        .engine
        .create_request(&as_user(ex.members.requester), "tutoring", 300, None)
        .await?;

    let ctx = CommandContext::new("cancel-key", Actor::User(ex.members.requester));
    ex.engine.cancel_request(&ctx, first.id).await?;
    let err = ex.engine.cancel_request(&ctx, second.id).await.unwrap_err();
    assert!(matches!(err, EngineError::IdempotencyKeyReused { .. }));

    assert_eq!(
        ex.engine.get_request(second.id).await?.state,
        RequestState::Created
    );
    Ok(())
}

#[tokio::test]
async fn test_replayed_grant_mints_once() -> Result<()> {
    let (mut ex, _temp) = test_exchange().await?;
    let ctx = CommandContext::new("welcome-bonus", Actor::System);

    let first = ex
        .engine
        .grant_credits(&ctx, ex.members.requester, 1000)
        .await?;
    let second = ex
        .engine
        .grant_credits(&ctx, ex.members.requester, 1000)
        .await?;

    assert_eq!(first.id, second.id);
    assert_eq!(
        ex.engine.get_balance(ex.members.requester).await?.available,
        1000
    );
    assert_eq!(ex.drain_events().len(), 1);
    Ok(())
}
