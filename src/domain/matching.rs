use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ServiceRequest, UserId};

/// How thoroughly the user directory has verified a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLevel {
    /// Email verified
    Basic,
    /// Email and phone verified
    Standard,
    /// Email, phone and address verified
    Premium,
    /// Vouched for by verified members
    Community,
}

impl VerificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationLevel::Basic => "basic",
            VerificationLevel::Standard => "standard",
            VerificationLevel::Premium => "premium",
            VerificationLevel::Community => "community",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "basic" => Some(VerificationLevel::Basic),
            "standard" => Some(VerificationLevel::Standard),
            "premium" => Some(VerificationLevel::Premium),
            "community" => Some(VerificationLevel::Community),
            _ => None,
        }
    }
}

impl std::fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the user directory knows about a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub is_active: bool,
    pub verification_level: VerificationLevel,
    pub average_rating: f64,
    pub services_completed: u32,
    /// Service types this member offers
    #[serde(default)]
    pub service_types: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn offers(&self, service_type: &str) -> bool {
        self.service_types
            .iter()
            .any(|s| s.eq_ignore_ascii_case(service_type))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub min_verification_level: VerificationLevel,
    /// Maximum number of in-flight requests a provider may hold
    pub max_concurrent_requests: u32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            min_verification_level: VerificationLevel::Basic,
            max_concurrent_requests: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligibility {
    UnknownUser,
    Inactive,
    Unverified {
        level: VerificationLevel,
        required: VerificationLevel,
    },
    SelfMatch,
    ServiceNotOffered,
    AtCapacity {
        in_flight: u32,
        limit: u32,
    },
}

impl std::fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligibility::UnknownUser => write!(f, "user is unknown to the directory"),
            Ineligibility::Inactive => write!(f, "user is not active"),
            Ineligibility::Unverified { level, required } => {
                write!(f, "verification level {} is below {}", level, required)
            }
            Ineligibility::SelfMatch => write!(f, "requester cannot provide their own request"),
            Ineligibility::ServiceNotOffered => write!(f, "user does not offer this service"),
            Ineligibility::AtCapacity { in_flight, limit } => {
                write!(f, "user already has {} of {} requests in flight", in_flight, limit)
            }
        }
    }
}

/// A provider that passed eligibility, with the data used to rank it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub profile: UserProfile,
    pub in_flight: u32,
}

/// Check whether `profile` may be matched to `request`.
pub fn check_eligibility(
    request: &ServiceRequest,
    profile: &UserProfile,
    in_flight: u32,
    policy: &MatchPolicy,
) -> Result<(), Ineligibility> {
    if profile.user_id == request.requester_id {
        return Err(Ineligibility::SelfMatch);
    }
    if !profile.is_active {
        return Err(Ineligibility::Inactive);
    }
    if profile.verification_level < policy.min_verification_level {
        return Err(Ineligibility::Unverified {
            level: profile.verification_level,
            required: policy.min_verification_level,
        });
    }
    if !profile.offers(&request.service_type) {
        return Err(Ineligibility::ServiceNotOffered);
    }
    if in_flight >= policy.max_concurrent_requests {
        return Err(Ineligibility::AtCapacity {
            in_flight,
            limit: policy.max_concurrent_requests,
        });
    }
    Ok(())
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.profile
        .average_rating
        .total_cmp(&a.profile.average_rating)
        .then(a.in_flight.cmp(&b.in_flight))
        .then(a.profile.created_at.cmp(&b.profile.created_at))
        .then(a.profile.user_id.cmp(&b.profile.user_id))
}

/// Filter `profiles` down to eligible providers and order them best-first:
/// highest rating, then lightest current load, then oldest account.
pub fn rank_candidates(
    request: &ServiceRequest,
    profiles: Vec<UserProfile>,
    in_flight: &HashMap<UserId, u32>,
    policy: &MatchPolicy,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = profiles
        .into_iter()
        .filter_map(|profile| {
            let load = in_flight.get(&profile.user_id).copied().unwrap_or(0);
            check_eligibility(request, &profile, load, policy)
                .ok()
                .map(|_| Candidate {
                    profile,
                    in_flight: load,
                })
        })
        .collect();

    candidates.sort_by(rank);
    candidates
}
