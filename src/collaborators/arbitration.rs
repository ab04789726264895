use std::collections::HashSet;

use crate::domain::{Actor, ServiceRequest, UserId};

/// Decides who may resolve a disputed request.
pub trait ArbitrationAuthority: Send + Sync {
    fn may_resolve(&self, actor: &Actor, request: &ServiceRequest) -> bool;
}

/// A fixed set of arbiters. An arbiter may never resolve a request they are
/// a party to.
#[derive(Debug, Clone, Default)]
pub struct ArbiterRoster {
    arbiters: HashSet<UserId>,
}

impl ArbiterRoster {
    pub fn new(arbiters: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            arbiters: arbiters.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arbiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arbiters.is_empty()
    }
}

impl ArbitrationAuthority for ArbiterRoster {
    fn may_resolve(&self, actor: &Actor, request: &ServiceRequest) -> bool {
        let Some(user_id) = actor.user_id() else {
            return false;
        };
        let is_party = user_id == request.requester_id || request.provider_id == Some(user_id);
        self.arbiters.contains(&user_id) && !is_party
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_only_listed_outsiders_may_resolve() {
        let arbiter = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let roster = ArbiterRoster::new([arbiter]);

        let mut request = ServiceRequest::new(Uuid::new_v4(), "tutoring", 100);
        request.provider_id = Some(Uuid::new_v4());

        assert!(roster.may_resolve(&Actor::User(arbiter), &request));
        assert!(!roster.may_resolve(&Actor::User(stranger), &request));
        assert!(!roster.may_resolve(&Actor::System, &request));
    }

    #[test]
    fn test_party_cannot_arbitrate_own_request() {
        let requester = Uuid::new_v4();
        let roster = ArbiterRoster::new([requester]);
        let request = ServiceRequest::new(requester, "tutoring", 100);

        assert!(!roster.may_resolve(&Actor::User(requester), &request));
        assert!(ArbiterRoster::empty().is_empty());
    }
}
