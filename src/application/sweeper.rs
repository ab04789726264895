use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::domain::{Actor, RequestId, RequestState};

use super::{CommandContext, EngineError, TransactionEngine};

/// States a request may time out in.
const EXPIRING_STATES: [RequestState; 2] = [RequestState::Matched, RequestState::Accepted];

/// Result of a timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cancelled: Vec<RequestId>,
    /// Requests that moved on before the sweep reached them
    pub skipped: Vec<RequestId>,
    pub failed: Vec<RequestId>,
}

impl TransactionEngine {
    /// Cancel every MATCHED or ACCEPTED request that has not changed for
    /// longer than the configured timeout, as of `now`.
    ///
    /// Cancellation runs as the system actor, so reserved credits are refunded
    /// exactly as for a user cancel. A request whose version changed after
    /// the scan is skipped, even if its new state could still be cancelled.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let timeout = chrono::Duration::from_std(self.config().request_timeout)
            .map_err(|err| EngineError::Storage(anyhow::anyhow!("invalid timeout: {}", err)))?;
        let stale = self
            .repository()
            .list_stale_requests(&EXPIRING_STATES, now - timeout)
            .await?;

        let mut report = SweepReport::default();
        for request in stale {
            let ctx = CommandContext::new(
                format!("sweep:{}:{}", request.id, request.version),
                Actor::System,
            )
            .with_reason(format!("timed out in {}", request.state));

            match self
                .cancel_if_unchanged(&ctx, request.id, request.version)
                .await
            {
                Ok(Some(_)) => report.cancelled.push(request.id),
                Ok(None) | Err(EngineError::IllegalTransition { .. }) => {
                    report.skipped.push(request.id)
                }
                Err(err) => {
                    tracing::warn!(request_id = %request.id, error = %err, "sweep failed to cancel request");
                    report.failed.push(request.id);
                }
            }
        }

        if !report.cancelled.is_empty() {
            tracing::info!(
                cancelled = report.cancelled.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "timeout sweep finished"
            );
        }
        Ok(report)
    }
}

/// Run [`TransactionEngine::sweep_expired`] every `interval` until the task
/// is aborted.
pub fn spawn_sweeper(engine: Arc<TransactionEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = engine.sweep_expired(Utc::now()).await {
                tracing::warn!(error = %err, "timeout sweep failed");
            }
        }
    })
}
