use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Credits, UserId};

pub type RequestId = Uuid;

/// Lifecycle state of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Created,
    Matched,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
    Disputed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Created => "created",
            RequestState::Matched => "matched",
            RequestState::Accepted => "accepted",
            RequestState::InProgress => "in_progress",
            RequestState::Completed => "completed",
            RequestState::Cancelled => "cancelled",
            RequestState::Disputed => "disputed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "created" => Some(RequestState::Created),
            "matched" => Some(RequestState::Matched),
            "accepted" => Some(RequestState::Accepted),
            "in_progress" => Some(RequestState::InProgress),
            "completed" => Some(RequestState::Completed),
            "cancelled" => Some(RequestState::Cancelled),
            "disputed" => Some(RequestState::Disputed),
            _ => None,
        }
    }

    /// True while the requester's credits are held for this request.
    pub fn holds_reservation(&self) -> bool {
        matches!(
            self,
            RequestState::Matched
                | RequestState::Accepted
                | RequestState::InProgress
                | RequestState::Disputed
        )
    }

    /// True while a provider is actively assigned (counts toward their limit).
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            RequestState::Matched | RequestState::Accepted | RequestState::InProgress
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Cancelled)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    User(UserId),
    /// The engine itself (timeout sweep)
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Actor::User(id) => Some(*id),
            Actor::System => None,
        }
    }

    pub fn is(&self, user_id: UserId) -> bool {
        self.user_id() == Some(user_id)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Actor::System),
            other => {
                let id = other.strip_prefix("user:").unwrap_or(other);
                Uuid::parse_str(id).ok().map(Actor::User)
            }
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::System => write!(f, "system"),
        }
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub position: i64,
    /// None for the entry that created the request
    pub from_state: Option<RequestState>,
    pub to_state: RequestState,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// A request for a service, paid for in credits.
/// Requests are never deleted; terminal requests are kept for their history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: RequestId,
    pub requester_id: UserId,
    /// Assigned once the request is matched
    pub provider_id: Option<UserId>,
    pub service_type: String,
    /// Price in credit units (always positive)
    pub amount: Credits,
    pub description: Option<String>,
    pub state: RequestState,
    /// Optimistic concurrency version of the stored row
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
}

impl ServiceRequest {
    /// Create a new request in the `Created` state, with its creation entry.
    pub fn new(requester_id: UserId, service_type: impl Into<String>, amount: Credits) -> Self {
        assert!(amount > 0, "Request amount must be positive");
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            requester_id,
            provider_id: None,
            service_type: service_type.into(),
            amount,
            description: None,
            state: RequestState::Created,
            version: 1,
            created_at: now,
            updated_at: now,
            history: vec![HistoryEntry {
                position: 0,
                from_state: None,
                to_state: RequestState::Created,
                actor: Actor::User(requester_id),
                occurred_at: now,
                reason: None,
            }],
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The other party of the request, from the point of view of `actor`.
    pub fn counterparty(&self, actor: &Actor) -> UserId {
        match self.provider_id {
            Some(provider) if !actor.is(provider) => provider,
            _ => self.requester_id,
        }
    }

    /// Record a transition: updates state and assignment, appends history.
    /// Returns the appended entry.
    pub fn record_transition(
        &mut self,
        to_state: RequestState,
        provider_id: Option<UserId>,
        actor: Actor,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> HistoryEntry {
        let entry = HistoryEntry {
            position: self.history.len() as i64,
            from_state: Some(self.state),
            to_state,
            actor,
            occurred_at: at,
            reason,
        };
        self.state = to_state;
        self.provider_id = provider_id;
        self.updated_at = at;
        self.history.push(entry.clone());
        entry
    }
}
