use sqlx::sqlite::SqliteConnection;

use crate::domain::{
    Credits, LedgerEffect, RequestId, TransactionKind, TransactionRecord, UserBalance, UserId,
    format_credits,
};
use crate::storage::Repository;

use super::{EngineError, RetryPolicy};

/// A credit movement, as understood by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    Grant { user_id: UserId, amount: Credits },
    Effect(LedgerEffect),
}

impl LedgerOp {
    pub fn kind(&self) -> TransactionKind {
        match self {
            LedgerOp::Grant { .. } => TransactionKind::Grant,
            LedgerOp::Effect(effect) => effect.kind(),
        }
    }

    fn amount(&self) -> Credits {
        match self {
            LedgerOp::Grant { amount, .. }
            | LedgerOp::Effect(LedgerEffect::Reserve { amount, .. })
            | LedgerOp::Effect(LedgerEffect::Release { amount, .. })
            | LedgerOp::Effect(LedgerEffect::Refund { amount, .. })
            | LedgerOp::Effect(LedgerEffect::Transfer { amount, .. }) => *amount,
        }
    }

    /// (from, to) as they appear on the transaction record.
    fn parties(&self) -> (Option<UserId>, UserId) {
        match *self {
            LedgerOp::Grant { user_id, .. } => (None, user_id),
            LedgerOp::Effect(LedgerEffect::Reserve { user_id, .. })
            | LedgerOp::Effect(LedgerEffect::Release { user_id, .. })
            | LedgerOp::Effect(LedgerEffect::Refund { user_id, .. }) => (Some(user_id), user_id),
            LedgerOp::Effect(LedgerEffect::Transfer { from, to, .. }) => (Some(from), to),
        }
    }
}

/// A record handed back by the ledger, and whether this call wrote it.
#[derive(Debug, Clone)]
pub struct Posted {
    pub record: TransactionRecord,
    /// True when the operation key had already been applied
    pub replayed: bool,
}

/// Key of the ledger operation performed for a command.
pub fn operation_key(command_key: &str, kind: TransactionKind) -> String {
    format!("{}:{}", command_key, kind)
}

/// The authoritative store of credit balances.
///
/// Each public operation runs in its own database transaction. The engine
/// instead calls [`Ledger::apply_in`] on the transaction it already holds, so
/// that balance changes commit together with the request update.
#[derive(Clone)]
pub struct Ledger {
    repo: Repository,
    retry: RetryPolicy,
}

impl Ledger {
    pub fn new(repo: Repository, retry: RetryPolicy) -> Self {
        Self { repo, retry }
    }

    /// Current balance. Users never referenced have a zero balance.
    pub async fn balance(&self, user_id: UserId) -> Result<UserBalance, EngineError> {
        Ok(self
            .repo
            .get_balance(user_id)
            .await?
            .unwrap_or_else(|| UserBalance::empty(user_id)))
    }

    pub async fn transactions(
        &self,
        user_id: Option<UserId>,
    ) -> Result<Vec<TransactionRecord>, EngineError> {
        Ok(self.repo.list_transactions(user_id).await?)
    }

    /// Mint credits into a user's available balance.
    pub async fn grant(
        &self,
        user_id: UserId,
        amount: Credits,
        key: &str,
    ) -> Result<TransactionRecord, EngineError> {
        self.execute(LedgerOp::Grant { user_id, amount }, None, key)
            .await
    }

    pub async fn reserve(
        &self,
        user_id: UserId,
        amount: Credits,
        request_id: Option<RequestId>,
        key: &str,
    ) -> Result<TransactionRecord, EngineError> {
        let op = LedgerOp::Effect(LedgerEffect::Reserve { user_id, amount });
        self.execute(op, request_id, key).await
    }

    pub async fn release(
        &self,
        user_id: UserId,
        amount: Credits,
        request_id: Option<RequestId>,
        key: &str,
    ) -> Result<TransactionRecord, EngineError> {
        let op = LedgerOp::Effect(LedgerEffect::Release { user_id, amount });
        self.execute(op, request_id, key).await
    }

    /// A release performed because the request was cancelled.
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: Credits,
        request_id: Option<RequestId>,
        key: &str,
    ) -> Result<TransactionRecord, EngineError> {
        let op = LedgerOp::Effect(LedgerEffect::Refund { user_id, amount });
        self.execute(op, request_id, key).await
    }

    /// Move reserved credits of `from` into the available balance of `to`.
    pub async fn transfer(
        &self,
        from: UserId,
        to: UserId,
        amount: Credits,
        request_id: Option<RequestId>,
        key: &str,
    ) -> Result<TransactionRecord, EngineError> {
        let op = LedgerOp::Effect(LedgerEffect::Transfer { from, to, amount });
        self.execute(op, request_id, key).await
    }

    async fn execute(
        &self,
        op: LedgerOp,
        request_id: Option<RequestId>,
        key: &str,
    ) -> Result<TransactionRecord, EngineError> {
        Ok(self.post(op, request_id, key).await?.record)
    }

    /// Apply `op` in its own transaction, retrying on contention.
    pub(crate) async fn post(
        &self,
        op: LedgerOp,
        request_id: Option<RequestId>,
        key: &str,
    ) -> Result<Posted, EngineError> {
        let name = format!("ledger.{}", op.kind());
        self.retry
            .run(&name, || async move {
                let mut tx = self.repo.begin().await?;
                let posted = Self::apply_in(&mut tx, op, request_id, key).await?;
                tx.commit().await?;
                Ok(posted)
            })
            .await
    }

    /// Apply `op` on an open connection and append its record.
    ///
    /// `key` is the full operation key. If a record with that key exists the
    /// operation already happened: the stored record is returned and no
    /// balance is touched.
    pub(crate) async fn apply_in(
        conn: &mut SqliteConnection,
        op: LedgerOp,
        request_id: Option<RequestId>,
        key: &str,
    ) -> Result<Posted, EngineError> {
        let amount = op.amount();
        if amount <= 0 {
            return Err(EngineError::InvalidAmount(format!(
                "{} amount must be positive, got {}",
                op.kind(),
                amount
            )));
        }

        let (from_user, to_user) = op.parties();

        if let Some(existing) = Repository::transaction_by_key_in(conn, key).await? {
            if existing.kind != op.kind()
                || existing.amount != amount
                || existing.from_user != from_user
                || existing.to_user != to_user
            {
                return Err(EngineError::IdempotencyKeyReused {
                    key: key.to_string(),
                    command: existing.kind.to_string(),
                });
            }
            tracing::debug!(operation_key = key, "ledger operation already applied");
            return Ok(Posted {
                record: existing,
                replayed: true,
            });
        }

        let mut touched = match op {
            LedgerOp::Grant { user_id, amount } => {
                let minted = Repository::total_granted_in(conn).await?;
                if minted.checked_add(amount).is_none() {
                    return Err(EngineError::InvalidAmount(format!(
                        "granting {} would exceed the credit supply",
                        format_credits(amount)
                    )));
                }
                let mut balance = Self::load_in(conn, user_id).await?;
                balance.grant(amount)?;
                vec![balance]
            }
            LedgerOp::Effect(LedgerEffect::Reserve { user_id, amount }) => {
                let mut balance = Self::load_in(conn, user_id).await?;
                balance.reserve(amount)?;
                vec![balance]
            }
            LedgerOp::Effect(
                LedgerEffect::Release { user_id, amount } | LedgerEffect::Refund { user_id, amount },
            ) => {
                let mut balance = Self::load_in(conn, user_id).await?;
                balance.release(amount)?;
                vec![balance]
            }
            LedgerOp::Effect(LedgerEffect::Transfer { from, to, amount }) => {
                if from == to {
                    return Err(EngineError::InvalidAmount(format!(
                        "user {} cannot transfer credits to themselves",
                        from
                    )));
                }
                let mut source = Self::load_in(conn, from).await?;
                let mut destination = Self::load_in(conn, to).await?;
                source.take_reserved(amount)?;
                destination.receive(amount)?;
                vec![source, destination]
            }
        };

        // Fixed write order across all operations.
        touched.sort_by_key(|b| b.user_id);
        for balance in &mut touched {
            Repository::save_balance_in(conn, balance).await?;
        }

        let mut record = TransactionRecord::new(op.kind(), from_user, to_user, amount, key);
        record.request_id = request_id;
        Repository::insert_transaction_in(conn, &mut record).await?;

        tracing::info!(
            kind = %record.kind,
            sequence = record.sequence,
            amount,
            from = ?from_user,
            to = %to_user,
            request_id = ?request_id,
            "ledger operation recorded"
        );
        Ok(Posted {
            record,
            replayed: false,
        })
    }

    async fn load_in(
        conn: &mut SqliteConnection,
        user_id: UserId,
    ) -> Result<UserBalance, EngineError> {
        Ok(Repository::balance_in(conn, user_id)
            .await?
            .unwrap_or_else(|| UserBalance::empty(user_id)))
    }
}
