use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Credits, RequestId, UserId};

pub type TransactionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Credits minted into a user's available balance
    Grant,
    /// Available -> reserved, same user
    Reserve,
    /// Reserved -> available after a provider declined
    Release,
    /// Reserved requester credits -> provider's available balance
    Transfer,
    /// Reserved -> available after a cancellation
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Grant => "grant",
            TransactionKind::Reserve => "reserve",
            TransactionKind::Release => "release",
            TransactionKind::Transfer => "transfer",
            TransactionKind::Refund => "refund",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "grant" => Some(TransactionKind::Grant),
            "reserve" => Some(TransactionKind::Reserve),
            "release" => Some(TransactionKind::Release),
            "transfer" => Some(TransactionKind::Transfer),
            "refund" => Some(TransactionKind::Refund),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable record of credits actually moving.
/// Records are append-only: they are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    /// Monotonically increasing, gap-free sequence number
    pub sequence: i64,
    /// The request this movement belongs to (absent for grants)
    pub request_id: Option<RequestId>,
    /// Source user (absent for grants)
    pub from_user: Option<UserId>,
    /// Destination user
    pub to_user: UserId,
    /// Amount in credit units (always positive)
    pub amount: Credits,
    pub kind: TransactionKind,
    /// Idempotency key of the ledger operation that produced this record
    pub operation_key: String,
    pub recorded_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Create a new record. Sequence number must be assigned by the repository.
    pub fn new(
        kind: TransactionKind,
        from_user: Option<UserId>,
        to_user: UserId,
        amount: Credits,
        operation_key: impl Into<String>,
    ) -> Self {
        assert!(amount > 0, "Transaction amount must be positive");
        Self {
            id: Uuid::new_v4(),
            sequence: 0, // Will be set by repository
            request_id: None,
            from_user,
            to_user,
            amount,
            kind,
            operation_key: operation_key.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// True if the record moves credits between two different users.
    pub fn crosses_users(&self) -> bool {
        self.from_user.is_some_and(|from| from != self.to_user)
    }
}
