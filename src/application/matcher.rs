use std::collections::HashMap;
use std::sync::Arc;

use crate::collaborators::UserDirectory;
use crate::domain::{
    Candidate, Ineligibility, MatchPolicy, ServiceRequest, UserId, UserProfile, check_eligibility,
    rank_candidates,
};

use super::EngineError;

/// Chooses providers for requests. Reads the user directory and the current
/// in-flight counts; never writes anything.
#[derive(Clone)]
pub struct Matcher {
    directory: Arc<dyn UserDirectory>,
    policy: MatchPolicy,
}

impl Matcher {
    pub fn new(directory: Arc<dyn UserDirectory>, policy: MatchPolicy) -> Self {
        Self { directory, policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Eligible providers for `request`, best first.
    pub async fn find_provider(
        &self,
        request: &ServiceRequest,
        in_flight: &HashMap<UserId, u32>,
    ) -> Result<Vec<Candidate>, EngineError> {
        let profiles = self.directory.providers(&request.service_type).await?;
        let candidates = rank_candidates(request, profiles, in_flight, &self.policy);

        tracing::debug!(
            request_id = %request.id,
            service_type = %request.service_type,
            candidates = candidates.len(),
            "ranked providers"
        );

        if candidates.is_empty() {
            return Err(EngineError::NoEligibleProvider(request.id));
        }
        Ok(candidates)
    }

    /// Check that a provider picked by the requester is eligible.
    pub async fn confirm_match(
        &self,
        request: &ServiceRequest,
        provider_id: UserId,
        in_flight: &HashMap<UserId, u32>,
    ) -> Result<UserProfile, EngineError> {
        let ineligible = |reason| EngineError::IneligibleProvider {
            provider_id,
            reason,
        };

        let profile = self
            .directory
            .profile(provider_id)
            .await?
            .ok_or_else(|| ineligible(Ineligibility::UnknownUser))?;

        let load = in_flight.get(&provider_id).copied().unwrap_or(0);
        check_eligibility(request, &profile, load, &self.policy).map_err(ineligible)?;
        Ok(profile)
    }
}
