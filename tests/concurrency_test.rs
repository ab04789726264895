mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{as_user, test_exchange};
use mutua::application::{CommandContext, EngineError};
use mutua::domain::{Actor, RequestState, TransactionKind};

async fn transfer_count(ex: &common::Exchange) -> Result<usize> {
    Ok(ex
        .engine
        .list_transactions(None)
        .await?
        .iter()
        .filter(|r| r.kind == TransactionKind::Transfer)
        .count())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completes_transfer_once() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let request = ex.request_in_progress(1000, 500).await?;

    let first = as_user(ex.members.requester);
    let second = as_user(ex.members.requester);
    let (a, b) = tokio::join!(
        ex.engine.complete_request(&first, request.id),
        ex.engine.complete_request(&second, request.id)
    );

    let results = [a, b];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    for result in &results {
        if let Err(err) = result {
            assert!(
                matches!(
                    err,
                    EngineError::IllegalTransition {
                        from: RequestState::Completed,
                        ..
                    }
                ),
                "unexpected error: {}",
                err
            );
        }
    }

    assert_eq!(transfer_count(&ex).await?, 1);
    let provider = ex.engine.get_balance(ex.members.provider).await?;
    assert_eq!(provider.available, 500);
    let requester = ex.engine.get_balance(ex.members.requester).await?;
    assert_eq!((requester.available, requester.reserved), (500, 0));

    assert!(ex.engine.check_integrity().await?.is_healthy());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retries_of_one_command_apply_once() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let request = ex.request_in_progress(1000, 500).await?;

    let ctx = CommandContext::new("complete-once", Actor::User(ex.members.requester));
    let (a, b) = tokio::join!(
        ex.engine.complete_request(&ctx, request.id),
        ex.engine.complete_request(&ctx, request.id)
    );

    assert_eq!(a?.state, RequestState::Completed);
    assert_eq!(b?.state, RequestState::Completed);
    assert_eq!(transfer_count(&ex).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_grant_retries_announce_once() -> Result<()> {
    let (mut ex, _temp) = test_exchange().await?;
    let user = ex.members.requester;

    let ctx = CommandContext::new("grant-once", Actor::System);
    let (a, b) = tokio::join!(
        ex.engine.grant_credits(&ctx, user, 800),
        ex.engine.grant_credits(&ctx, user, 800)
    );
    let (a, b) = (a?, b?);
    assert_eq!(a.id, b.id);
    assert_eq!(ex.engine.get_balance(user).await?.available, 800);

    let events = ex.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "credits.granted");
    assert_eq!(events[0].payload["sequence"], a.sequence);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_complete_racing_cancel_settles_one_way() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;

    // Accepted requests may still be cancelled by the requester
    let request = ex.matched_request(1000, 500).await?;
    ex.engine
        .accept_request(&as_user(ex.members.provider), request.id)
        .await?;

    let start = as_user(ex.members.provider);
    let cancel = as_user(ex.members.requester);
    let (started, cancelled) = tokio::join!(
        ex.engine.start_request(&start, request.id),
        ex.engine.cancel_request(&cancel, request.id)
    );
    assert!(started.is_ok() || cancelled.is_ok());

    let stored = ex.engine.get_request(request.id).await?;
    let balance = ex.engine.get_balance(ex.members.requester).await?;
    match stored.state {
        RequestState::InProgress => assert_eq!(balance.reserved, 500),
        RequestState::Cancelled => {
            assert_eq!((balance.available, balance.reserved), (1000, 0))
        }
        other => panic!("unexpected state {}", other),
    }
    assert!(ex.engine.check_integrity().await?.is_healthy());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_matches_never_overdraw() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let requester = ex.members.requester;

    ex.grant(requester, 1000).await?;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let request = ex
            .engine
            .create_request(&as_user(requester), "tutoring", 400, None)
            .await?;
        ids.push(request.id);
    }

    let (c1, c2, c3) = (as_user(requester), as_user(requester), as_user(requester));
    let (r1, r2, r3) = tokio::join!(
        ex.engine.match_request(&c1, ids[0], Some(ex.members.provider)),
        ex.engine.match_request(&c2, ids[1], Some(ex.members.backup)),
        ex.engine.match_request(&c3, ids[2], Some(ex.members.provider))
    );
    let results = [r1, r2, r3];

    let matched = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(matched, 2);
    for result in &results {
        if let Err(err) = result {
            assert!(
                matches!(err, EngineError::InsufficientCredits { .. }),
                "unexpected error: {}",
                err
            );
        }
    }

    let balance = ex.engine.get_balance(requester).await?;
    assert_eq!((balance.available, balance.reserved), (200, 800));
    assert!(balance.available >= 0);
    assert!(ex.engine.check_integrity().await?.is_healthy());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_lifecycles_keep_ledger_consistent() -> Result<()> {
    let (ex, _temp) = test_exchange().await?;
    let engine = Arc::new(ex.engine);
    let requester = ex.members.requester;
    let providers = [ex.members.provider, ex.members.backup];

    engine
        .grant_credits(&common::as_system(), requester, 2000)
        .await?;

    let mut handles = Vec::new();
    for i in 0..4 {
        let engine = Arc::clone(&engine);
        let provider = providers[i % 2];
        handles.push(tokio::spawn(async move {
            let request = engine
                .create_request(&as_user(requester), "tutoring", 250, None)
                .await?;
            engine
                .match_request(&as_user(requester), request.id, Some(provider))
                .await?;
            engine.accept_request(&as_user(provider), request.id).await?;
            engine.start_request(&as_user(provider), request.id).await?;
            engine
                .complete_request(&as_user(requester), request.id)
                .await?;
            Ok::<_, EngineError>(request.id)
        }));
    }
    for handle in handles {
        handle.await??;
    }

    let balance = engine.get_balance(requester).await?;
    assert_eq!((balance.available, balance.reserved), (1000, 0));
    let earned: i64 = [
        engine.get_balance(providers[0]).await?.available,
        engine.get_balance(providers[1]).await?.available,
    ]
    .iter()
    .sum();
    assert_eq!(earned, 1000);

    let report = engine.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.transaction_count, 1 + 4 * 2);
    Ok(())
}
