//! Transition table for service requests.
//!
//! ```text
//! CREATED --match--> MATCHED --accept--> ACCEPTED --start--> IN_PROGRESS --complete--> COMPLETED
//!    ^                  |                                         |
//!    +-----decline------+                                      dispute
//!                                                                 v
//! CREATED|MATCHED|ACCEPTED --cancel--> CANCELLED      DISPUTED --resolve--> COMPLETED | CANCELLED
//! ```
//!
//! [`apply`] is a pure function: it validates an event against the current
//! request and returns the target state plus the ledger effects the caller
//! must execute. It never touches storage.

use serde::{Deserialize, Serialize};

use super::{Actor, Credits, RequestState, ServiceRequest, TransactionKind, UserId};

/// Outcome of an arbitration decision on a disputed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// The provider is paid
    Completed,
    /// The requester is refunded
    Cancelled,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Completed => "completed",
            Resolution::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "completed" | "complete" => Some(Resolution::Completed),
            "cancelled" | "cancel" => Some(Resolution::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Match { provider_id: UserId },
    Accept,
    Decline,
    Start,
    Complete,
    Cancel,
    Dispute,
    Resolve(Resolution),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Match { .. } => "match",
            Event::Accept => "accept",
            Event::Decline => "decline",
            Event::Start => "start",
            Event::Complete => "complete",
            Event::Cancel => "cancel",
            Event::Dispute => "dispute",
            Event::Resolve(_) => "resolve",
        }
    }

    /// Name of the outbound event emitted when this transition commits.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Match { .. } => "request.matched",
            Event::Accept => "request.accepted",
            Event::Decline => "request.declined",
            Event::Start => "request.started",
            Event::Complete => "request.completed",
            Event::Cancel => "request.cancelled",
            Event::Dispute => "request.disputed",
            Event::Resolve(_) => "request.resolved",
        }
    }
}

/// A credit movement required by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    Reserve { user_id: UserId, amount: Credits },
    Release { user_id: UserId, amount: Credits },
    Refund { user_id: UserId, amount: Credits },
    Transfer { from: UserId, to: UserId, amount: Credits },
}

impl LedgerEffect {
    pub fn kind(&self) -> TransactionKind {
        match self {
            LedgerEffect::Reserve { .. } => TransactionKind::Reserve,
            LedgerEffect::Release { .. } => TransactionKind::Release,
            LedgerEffect::Refund { .. } => TransactionKind::Refund,
            LedgerEffect::Transfer { .. } => TransactionKind::Transfer,
        }
    }
}

/// A validated transition, ready to be executed.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: RequestState,
    pub to: RequestState,
    /// Provider assignment after the transition
    pub provider_id: Option<UserId>,
    pub effects: Vec<LedgerEffect>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    Illegal {
        from: RequestState,
        event: &'static str,
    },
    Unauthorized {
        actor: Actor,
        event: &'static str,
    },
    SelfMatch,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionError::Illegal { from, event } => {
                write!(f, "cannot {} a request in state {}", event, from)
            }
            TransitionError::Unauthorized { actor, event } => {
                write!(f, "{} may not {} this request", actor, event)
            }
            TransitionError::SelfMatch => write!(f, "a requester cannot provide their own request"),
        }
    }
}

impl std::error::Error for TransitionError {}

/// Every (from, to) pair a history may contain after the creation entry.
pub const LEGAL_EDGES: &[(RequestState, RequestState)] = &[
    (RequestState::Created, RequestState::Matched),
    (RequestState::Matched, RequestState::Accepted),
    (RequestState::Matched, RequestState::Created),
    (RequestState::Accepted, RequestState::InProgress),
    (RequestState::InProgress, RequestState::Completed),
    (RequestState::Created, RequestState::Cancelled),
    (RequestState::Matched, RequestState::Cancelled),
    (RequestState::Accepted, RequestState::Cancelled),
    (RequestState::InProgress, RequestState::Disputed),
    (RequestState::Disputed, RequestState::Completed),
    (RequestState::Disputed, RequestState::Cancelled),
];

fn target(from: RequestState, event: &Event) -> Option<RequestState> {
    use RequestState::*;

    match (from, event) {
        (Created, Event::Match { .. }) => Some(Matched),
        (Matched, Event::Accept) => Some(Accepted),
        (Matched, Event::Decline) => Some(Created),
        (Accepted, Event::Start) => Some(InProgress),
        (InProgress, Event::Complete) => Some(Completed),
        (Created | Matched | Accepted, Event::Cancel) => Some(Cancelled),
        (InProgress, Event::Dispute) => Some(Disputed),
        (Disputed, Event::Resolve(Resolution::Completed)) => Some(Completed),
        (Disputed, Event::Resolve(Resolution::Cancelled)) => Some(Cancelled),
        _ => None,
    }
}

fn authorized(request: &ServiceRequest, event: &Event, actor: &Actor, is_arbiter: bool) -> bool {
    let is_requester = actor.is(request.requester_id);
    let is_provider = request.provider_id.is_some_and(|p| actor.is(p));

    match event {
        Event::Match { .. } => is_requester || *actor == Actor::System,
        Event::Accept | Event::Decline | Event::Start => is_provider,
        Event::Complete => is_requester,
        Event::Cancel => {
            is_requester
                || *actor == Actor::System
                || (is_provider && request.state == RequestState::Matched)
        }
        Event::Dispute => is_requester || is_provider,
        Event::Resolve(_) => is_arbiter,
    }
}

/// State and actor guards of `event`, without data guards or effects.
/// Returns the target state.
pub fn guard(
    request: &ServiceRequest,
    event: &Event,
    actor: &Actor,
    is_arbiter: bool,
) -> Result<RequestState, TransitionError> {
    let from = request.state;
    let to = target(from, event).ok_or(TransitionError::Illegal {
        from,
        event: event.name(),
    })?;

    if !authorized(request, event, actor, is_arbiter) {
        return Err(TransitionError::Unauthorized {
            actor: *actor,
            event: event.name(),
        });
    }
    Ok(to)
}

/// Validate `event` against `request` and compute the resulting transition.
///
/// `is_arbiter` tells whether the arbitration authority accepts `actor` as
/// the decider for this request; it is only consulted for `Resolve`.
pub fn apply(
    request: &ServiceRequest,
    event: &Event,
    actor: &Actor,
    is_arbiter: bool,
) -> Result<Transition, TransitionError> {
    let from = request.state;
    let to = guard(request, event, actor, is_arbiter)?;
    let illegal = TransitionError::Illegal {
        from,
        event: event.name(),
    };

    let requester = request.requester_id;
    let amount = request.amount;
    let mut provider_id = request.provider_id;

    let effects = match event {
        Event::Match { provider_id: chosen } => {
            if *chosen == requester {
                return Err(TransitionError::SelfMatch);
            }
            provider_id = Some(*chosen);
            vec![LedgerEffect::Reserve {
                user_id: requester,
                amount,
            }]
        }
        Event::Decline => {
            provider_id = None;
            vec![LedgerEffect::Release {
                user_id: requester,
                amount,
            }]
        }
        Event::Complete | Event::Resolve(Resolution::Completed) => {
            let provider = request.provider_id.ok_or(illegal)?;
            vec![LedgerEffect::Transfer {
                from: requester,
                to: provider,
                amount,
            }]
        }
        Event::Cancel | Event::Resolve(Resolution::Cancelled) if from.holds_reservation() => {
            vec![LedgerEffect::Refund {
                user_id: requester,
                amount,
            }]
        }
        _ => Vec::new(),
    };

    Ok(Transition {
        from,
        to,
        provider_id,
        effects,
    })
}

/// True if a recorded history is a valid walk of the transition table.
pub fn is_valid_walk(request: &ServiceRequest) -> bool {
    let mut expected_from = None;
    for (position, entry) in request.history.iter().enumerate() {
        if entry.position != position as i64 || entry.from_state != expected_from {
            return false;
        }
        match entry.from_state {
            None if entry.to_state != RequestState::Created => return false,
            Some(from) if !LEGAL_EDGES.contains(&(from, entry.to_state)) => return false,
            _ => {}
        }
        expected_from = Some(entry.to_state);
    }
    expected_from == Some(request.state)
}
