use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::collaborators::{ArbitrationAuthority, NotificationSink, OutboundEvent, UserDirectory};
use crate::domain::{
    Actor, Credits, Event, HistoryEntry, IntegrityReport, MatchPolicy, RequestId, RequestState,
    Resolution, ServiceRequest, TransactionKind, TransactionRecord, UserBalance, UserId,
    build_integrity_report, state_machine,
};
use crate::storage::{ProcessedCommand, Repository};

use super::{EngineError, Ledger, LedgerOp, Matcher, RetryPolicy, operation_key};

const CREATE_COMMAND: &str = "create";

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// MATCHED or ACCEPTED requests untouched for this long are auto-cancelled
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
    pub matching: MatchPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(48 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            matching: MatchPolicy::default(),
        }
    }
}

/// The services the engine consults but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn UserDirectory>,
    pub notifier: Arc<dyn NotificationSink>,
    pub arbitration: Arc<dyn ArbitrationAuthority>,
}

/// Who issues a command and under which idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub idempotency_key: String,
    pub actor: Actor,
    pub reason: Option<String>,
}

impl CommandContext {
    pub fn new(idempotency_key: impl Into<String>, actor: Actor) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            actor,
            reason: None,
        }
    }

    /// A context with a freshly generated key.
    pub fn fresh(actor: Actor) -> Self {
        Self::new(Uuid::new_v4().to_string(), actor)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Result of one attempt at a transition.
enum Outcome {
    Applied {
        request: ServiceRequest,
        from: RequestState,
        records: Vec<TransactionRecord>,
    },
    /// The key was already processed; nothing happened.
    Replayed(ServiceRequest),
    /// The request changed since the caller read it; nothing happened.
    Superseded(ServiceRequest),
}

/// The public face of the credit exchange.
///
/// Every command validates, runs the state machine and applies ledger
/// effects inside one database transaction, then publishes events once the
/// transaction has committed.
pub struct TransactionEngine {
    repo: Repository,
    ledger: Ledger,
    matcher: Matcher,
    directory: Arc<dyn UserDirectory>,
    notifier: Arc<dyn NotificationSink>,
    arbitration: Arc<dyn ArbitrationAuthority>,
    config: EngineConfig,
}

impl TransactionEngine {
    pub fn new(repo: Repository, collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            ledger: Ledger::new(repo.clone(), config.retry),
            matcher: Matcher::new(collaborators.directory.clone(), config.matching),
            repo,
            directory: collaborators.directory,
            notifier: collaborators.notifier,
            arbitration: collaborators.arbitration,
            config,
        }
    }

    /// Initialize a new database at the given path.
    pub async fn init(
        database_path: &str,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let repo = Repository::init(&db_url).await?;
        Ok(Self::new(repo, collaborators, config))
    }

    /// Connect to an existing database.
    pub async fn connect(
        database_path: &str,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let db_url = format!("sqlite:{}", database_path);
        let repo = Repository::connect(&db_url).await?;
        Ok(Self::new(repo, collaborators, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub(crate) fn repository(&self) -> &Repository {
        &self.repo
    }

    pub async fn close(&self) {
        self.repo.close().await;
    }

    // ========================
    // Commands
    // ========================

    /// Create a request on behalf of the actor, who becomes the requester.
    pub async fn create_request(
        &self,
        ctx: &CommandContext,
        service_type: &str,
        amount: Credits,
        description: Option<String>,
    ) -> Result<ServiceRequest, EngineError> {
        if let Some(request) = self.replayed(ctx, CREATE_COMMAND, None).await? {
            return Ok(request);
        }

        let Some(requester) = ctx.actor.user_id() else {
            return Err(EngineError::Unauthorized {
                actor: ctx.actor,
                action: "create a request".to_string(),
            });
        };
        if amount <= 0 {
            return Err(EngineError::InvalidAmount(
                "Request amount must be positive".to_string(),
            ));
        }

        let profile = self
            .config
            .retry
            .run("directory.profile", || async move {
                Ok(self.directory.profile(requester).await?)
            })
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", requester)))?;
        if !profile.is_active {
            return Err(EngineError::Unauthorized {
                actor: ctx.actor,
                action: "create a request while inactive".to_string(),
            });
        }

        let outcome = self
            .config
            .retry
            .run(CREATE_COMMAND, || {
                self.try_create(ctx, requester, service_type, amount, description.clone())
            })
            .await?;

        match outcome {
            Outcome::Replayed(request) | Outcome::Superseded(request) => Ok(request),
            Outcome::Applied { request, .. } => {
                tracing::info!(
                    request_id = %request.id,
                    requester = %requester,
                    service_type = %request.service_type,
                    amount,
                    "request created"
                );
                self.publish(OutboundEvent::new(
                    "request.created",
                    Some(request.id),
                    requester,
                    json!({
                        "state": request.state,
                        "service_type": request.service_type,
                        "amount": request.amount,
                    }),
                ))
                .await;
                Ok(request)
            }
        }
    }

    async fn try_create(
        &self,
        ctx: &CommandContext,
        requester: UserId,
        service_type: &str,
        amount: Credits,
        description: Option<String>,
    ) -> Result<Outcome, EngineError> {
        let mut tx = self.repo.begin().await?;

        if let Some(done) =
            Repository::processed_command_in(&mut tx, &ctx.idempotency_key).await?
        {
            let request_id = check_replay(&done, CREATE_COMMAND, None)?;
            let request = Repository::request_in(&mut tx, request_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("request {}", request_id)))?;
            return Ok(Outcome::Replayed(request));
        }

        let mut request = ServiceRequest::new(requester, service_type.trim(), amount);
        request.description = description;
        if let Some(entry) = request.history.first_mut() {
            entry.reason = ctx.reason.clone();
        }

        Repository::insert_request_in(&mut tx, &request).await?;
        Repository::record_command_in(
            &mut tx,
            &ProcessedCommand {
                idempotency_key: ctx.idempotency_key.clone(),
                command: CREATE_COMMAND.to_string(),
                request_id: request.id,
                recorded_at: Utc::now(),
            },
        )
        .await?;
        tx.commit().await?;

        Ok(Outcome::Applied {
            from: request.state,
            request,
            records: Vec::new(),
        })
    }

    /// Assign a provider and reserve the requester's credits.
    ///
    /// With `provider` set the requester's choice is confirmed against the
    /// eligibility rules; otherwise the best ranked candidate is taken.
    pub async fn match_request(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
        provider: Option<UserId>,
    ) -> Result<ServiceRequest, EngineError> {
        if let Some(request) = self.replayed(ctx, "match", Some(request_id)).await? {
            return Ok(request);
        }

        let request = self.get_request(request_id).await?;
        let candidate = Event::Match {
            provider_id: provider.unwrap_or(request.requester_id),
        };
        state_machine::guard(&request, &candidate, &ctx.actor, false)
            .map_err(|err| EngineError::from_transition(&request, err))?;

        let provider_id = self
            .config
            .retry
            .run("match.select", || self.select_provider(&request, provider))
            .await?;

        self.transition(ctx, request_id, Event::Match { provider_id })
            .await
    }

    async fn select_provider(
        &self,
        request: &ServiceRequest,
        provider: Option<UserId>,
    ) -> Result<UserId, EngineError> {
        let in_flight: HashMap<UserId, u32> = self.repo.in_flight_counts().await?;
        match provider {
            Some(provider_id) => {
                self.matcher
                    .confirm_match(request, provider_id, &in_flight)
                    .await?;
                Ok(provider_id)
            }
            None => {
                let candidates = self.matcher.find_provider(request, &in_flight).await?;
                candidates
                    .first()
                    .map(|c| c.profile.user_id)
                    .ok_or(EngineError::NoEligibleProvider(request.id))
            }
        }
    }

    pub async fn accept_request(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
    ) -> Result<ServiceRequest, EngineError> {
        self.transition(ctx, request_id, Event::Accept).await
    }

    /// The provider turns the request down; it goes back to the matching pool.
    pub async fn decline_request(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
    ) -> Result<ServiceRequest, EngineError> {
        self.transition(ctx, request_id, Event::Decline).await
    }

    pub async fn start_request(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
    ) -> Result<ServiceRequest, EngineError> {
        self.transition(ctx, request_id, Event::Start).await
    }

    /// The requester confirms the service was delivered; credits move to the provider.
    pub async fn complete_request(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
    ) -> Result<ServiceRequest, EngineError> {
        self.transition(ctx, request_id, Event::Complete).await
    }

    pub async fn cancel_request(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
    ) -> Result<ServiceRequest, EngineError> {
        self.transition(ctx, request_id, Event::Cancel).await
    }

    /// Cancel a request only if it is still at `expected_version`.
    ///
    /// The version is compared inside the cancelling transaction. `None`
    /// means the request moved on and was left untouched.
    pub(crate) async fn cancel_if_unchanged(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
        expected_version: i64,
    ) -> Result<Option<ServiceRequest>, EngineError> {
        match self
            .run_transition(ctx, request_id, Event::Cancel, Some(expected_version))
            .await?
        {
            Outcome::Superseded(request) => {
                tracing::debug!(
                    request_id = %request.id,
                    expected_version,
                    version = request.version,
                    "request changed, cancel skipped"
                );
                Ok(None)
            }
            Outcome::Applied { request, .. } | Outcome::Replayed(request) => Ok(Some(request)),
        }
    }

    pub async fn dispute_request(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
    ) -> Result<ServiceRequest, EngineError> {
        self.transition(ctx, request_id, Event::Dispute).await
    }

    /// Settle a disputed request. Only actors accepted by the arbitration
    /// authority may do this.
    pub async fn resolve_dispute(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
        resolution: Resolution,
    ) -> Result<ServiceRequest, EngineError> {
        self.transition(ctx, request_id, Event::Resolve(resolution))
            .await
    }

    /// Mint credits for a member. Only the system may grant.
    pub async fn grant_credits(
        &self,
        ctx: &CommandContext,
        user_id: UserId,
        amount: Credits,
    ) -> Result<TransactionRecord, EngineError> {
        if ctx.actor != Actor::System {
            return Err(EngineError::Unauthorized {
                actor: ctx.actor,
                action: "grant credits".to_string(),
            });
        }
        if amount <= 0 {
            return Err(EngineError::InvalidAmount(
                "Grant amount must be positive".to_string(),
            ));
        }

        self.config
            .retry
            .run("directory.profile", || async move {
                Ok(self.directory.profile(user_id).await?)
            })
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", user_id)))?;

        let key = operation_key(&ctx.idempotency_key, TransactionKind::Grant);
        let posted = self
            .ledger
            .post(LedgerOp::Grant { user_id, amount }, None, &key)
            .await?;

        if !posted.replayed {
            self.publish(OutboundEvent::new(
                "credits.granted",
                None,
                user_id,
                json!({ "amount": amount, "sequence": posted.record.sequence }),
            ))
            .await;
        }
        Ok(posted.record)
    }

    // ========================
    // Queries
    // ========================

    /// Current balance; zero for users never referenced.
    pub async fn get_balance(&self, user_id: UserId) -> Result<UserBalance, EngineError> {
        self.ledger.balance(user_id).await
    }

    /// Every stored balance, ordered by user.
    pub async fn list_balances(&self) -> Result<Vec<UserBalance>, EngineError> {
        Ok(self.repo.list_balances().await?)
    }

    pub async fn get_request(&self, request_id: RequestId) -> Result<ServiceRequest, EngineError> {
        self.repo
            .get_request(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("request {}", request_id)))
    }

    /// Ordered state transitions of a request.
    pub async fn get_history(&self, request_id: RequestId) -> Result<Vec<HistoryEntry>, EngineError> {
        Ok(self.get_request(request_id).await?.history)
    }

    /// All requests, or only those where `user_id` is a party.
    pub async fn list_requests(
        &self,
        user_id: Option<UserId>,
    ) -> Result<Vec<ServiceRequest>, EngineError> {
        Ok(self.repo.list_requests(user_id).await?)
    }

    pub async fn list_transactions(
        &self,
        user_id: Option<UserId>,
    ) -> Result<Vec<TransactionRecord>, EngineError> {
        self.ledger.transactions(user_id).await
    }

    /// Ledger records produced for one request, in sequence order.
    pub async fn request_transactions(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<TransactionRecord>, EngineError> {
        self.get_request(request_id).await?;
        Ok(self.repo.list_transactions_for_request(request_id).await?)
    }

    /// Check ledger integrity and return a report.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, EngineError> {
        let balances = self.repo.list_balances().await?;
        let records = self.repo.list_transactions(None).await?;
        let held = self.repo.reserved_by_requester().await?;

        Ok(build_integrity_report(&balances, &records, &held))
    }

    // ========================
    // Transition pipeline
    // ========================

    async fn transition(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
        event: Event,
    ) -> Result<ServiceRequest, EngineError> {
        match self.run_transition(ctx, request_id, event, None).await? {
            Outcome::Applied { request, .. }
            | Outcome::Replayed(request)
            | Outcome::Superseded(request) => Ok(request),
        }
    }

    async fn run_transition(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
        event: Event,
        expected_version: Option<i64>,
    ) -> Result<Outcome, EngineError> {
        if let Some(request) = self.replayed(ctx, event.name(), Some(request_id)).await? {
            return Ok(Outcome::Replayed(request));
        }

        let outcome = self
            .config
            .retry
            .run(event.name(), || {
                self.try_transition(ctx, request_id, event, expected_version)
            })
            .await?;

        match outcome {
            Outcome::Applied {
                request,
                from,
                records,
            } => {
                tracing::info!(
                    request_id = %request.id,
                    event = event.name(),
                    from = %from,
                    to = %request.state,
                    actor = %ctx.actor,
                    records = records.len(),
                    "transition committed"
                );
                self.emit_transition(ctx, &request, from, &event, &records)
                    .await;
                Ok(Outcome::Applied {
                    request,
                    from,
                    records,
                })
            }
            other => Ok(other),
        }
    }

    /// One attempt: validate, move credits, update the request and record the
    /// command, all in one database transaction.
    async fn try_transition(
        &self,
        ctx: &CommandContext,
        request_id: RequestId,
        event: Event,
        expected_version: Option<i64>,
    ) -> Result<Outcome, EngineError> {
        let mut tx = self.repo.begin().await?;

        if let Some(done) =
            Repository::processed_command_in(&mut tx, &ctx.idempotency_key).await?
        {
            check_replay(&done, event.name(), Some(request_id))?;
            let request = Repository::request_in(&mut tx, request_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("request {}", request_id)))?;
            return Ok(Outcome::Replayed(request));
        }

        let mut request = Repository::request_in(&mut tx, request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("request {}", request_id)))?;

        if expected_version.is_some_and(|version| version != request.version) {
            return Ok(Outcome::Superseded(request));
        }

        let is_arbiter = matches!(event, Event::Resolve(_))
            && self.arbitration.may_resolve(&ctx.actor, &request);
        let transition = state_machine::apply(&request, &event, &ctx.actor, is_arbiter)
            .map_err(|err| EngineError::from_transition(&request, err))?;

        let mut records = Vec::with_capacity(transition.effects.len());
        for effect in &transition.effects {
            let key = operation_key(&ctx.idempotency_key, effect.kind());
            let posted =
                Ledger::apply_in(&mut tx, LedgerOp::Effect(*effect), Some(request.id), &key)
                    .await?;
            records.push(posted.record);
        }

        let entry = request.record_transition(
            transition.to,
            transition.provider_id,
            ctx.actor,
            ctx.reason.clone(),
            Utc::now(),
        );
        Repository::update_request_in(&mut tx, &mut request).await?;
        Repository::insert_history_in(&mut tx, request.id, &entry).await?;
        Repository::record_command_in(
            &mut tx,
            &ProcessedCommand {
                idempotency_key: ctx.idempotency_key.clone(),
                command: event.name().to_string(),
                request_id: request.id,
                recorded_at: entry.occurred_at,
            },
        )
        .await?;
        tx.commit().await?;

        Ok(Outcome::Applied {
            request,
            from: transition.from,
            records,
        })
    }

    /// Snapshot of the request if this key was already processed for the
    /// same command.
    async fn replayed(
        &self,
        ctx: &CommandContext,
        command: &str,
        request_id: Option<RequestId>,
    ) -> Result<Option<ServiceRequest>, EngineError> {
        let Some(done) = self.repo.get_processed_command(&ctx.idempotency_key).await? else {
            return Ok(None);
        };
        let request_id = check_replay(&done, command, request_id)?;
        tracing::debug!(
            key = %ctx.idempotency_key,
            command,
            request_id = %request_id,
            "replayed command"
        );
        Ok(Some(self.get_request(request_id).await?))
    }

    // ========================
    // Events
    // ========================

    async fn emit_transition(
        &self,
        ctx: &CommandContext,
        request: &ServiceRequest,
        from: RequestState,
        event: &Event,
        records: &[TransactionRecord],
    ) {
        let mut payload = json!({
            "from": from,
            "state": request.state,
            "actor": ctx.actor.to_string(),
            "amount": request.amount,
            "provider_id": request.provider_id,
        });
        if let Event::Resolve(resolution) = event {
            payload["resolution"] = json!(resolution.as_str());
        }
        if let Some(reason) = &ctx.reason {
            payload["reason"] = json!(reason);
        }

        self.publish(OutboundEvent::new(
            event.event_type(),
            Some(request.id),
            request.counterparty(&ctx.actor),
            payload,
        ))
        .await;

        for record in records.iter().filter(|r| r.kind == TransactionKind::Transfer) {
            self.publish(OutboundEvent::new(
                "credits.received",
                record.request_id,
                record.to_user,
                json!({
                    "amount": record.amount,
                    "from": record.from_user,
                    "sequence": record.sequence,
                }),
            ))
            .await;
        }
    }

    /// Best-effort delivery: failures are logged and dropped.
    async fn publish(&self, event: OutboundEvent) {
        if let Err(err) = self.notifier.publish(&event).await {
            tracing::warn!(
                event_type = %event.event_type,
                target_user = %event.target_user,
                error = %err,
                "dropping notification"
            );
        }
    }
}

/// Validate that a processed command matches the one being replayed.
fn check_replay(
    done: &ProcessedCommand,
    command: &str,
    request_id: Option<RequestId>,
) -> Result<RequestId, EngineError> {
    let same_request = request_id.is_none_or(|id| id == done.request_id);
    if done.command != command || !same_request {
        return Err(EngineError::IdempotencyKeyReused {
            key: done.idempotency_key.clone(),
            command: done.command.clone(),
        });
    }
    Ok(done.request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processed(command: &str, request_id: RequestId) -> ProcessedCommand {
        ProcessedCommand {
            idempotency_key: "k1".to_string(),
            command: command.to_string(),
            request_id,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_check_replay_same_command() {
        let id = Uuid::new_v4();
        assert_eq!(check_replay(&processed("accept", id), "accept", Some(id)).unwrap(), id);
        assert_eq!(check_replay(&processed("create", id), "create", None).unwrap(), id);
    }

    #[test]
    fn test_check_replay_rejects_reuse() {
        let id = Uuid::new_v4();
        assert!(matches!(
            check_replay(&processed("accept", id), "start", Some(id)),
            Err(EngineError::IdempotencyKeyReused { .. })
        ));
        assert!(matches!(
            check_replay(&processed("accept", id), "accept", Some(Uuid::new_v4())),
            Err(EngineError::IdempotencyKeyReused { .. })
        ));
    }

    #[test]
    fn test_command_context() {
        let ctx = CommandContext::fresh(Actor::System).with_reason("timed out");
        assert_eq!(ctx.reason.as_deref(), Some("timed out"));
        assert!(Uuid::parse_str(&ctx.idempotency_key).is_ok());
    }
}
