use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CollaboratorError;
use crate::domain::{UserId, UserProfile};

/// Read-only view of the user-directory service.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Profile of a single member, or `None` if the member does not exist.
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, CollaboratorError>;

    /// Every member offering `service_type`, eligible or not.
    async fn providers(&self, service_type: &str) -> Result<Vec<UserProfile>, CollaboratorError>;
}

/// An in-memory user directory.
///
/// Can be loaded from a JSON array of profiles. The `reachable` switch lets
/// tests simulate an outage of the directory service.
#[derive(Default, Clone)]
pub struct StaticDirectory {
    profiles: Arc<RwLock<HashMap<UserId, UserProfile>>>,
    unreachable: Arc<AtomicBool>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let map = profiles.into_iter().map(|p| (p.user_id, p)).collect();
        Self {
            profiles: Arc::new(RwLock::new(map)),
            unreachable: Arc::default(),
        }
    }

    /// Load profiles from a JSON file containing an array of profiles.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read user directory {}", path.display()))?;
        let profiles: Vec<UserProfile> =
            serde_json::from_str(&content).context("Invalid user directory JSON")?;
        Ok(Self::from_profiles(profiles))
    }

    pub async fn insert(&self, profile: UserProfile) {
        self.profiles.write().await.insert(profile.user_id, profile);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), CollaboratorError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(CollaboratorError::new("user-directory", "service unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn profile(&self, user_id: UserId) -> Result<Option<UserProfile>, CollaboratorError> {
        self.check_reachable()?;
        Ok(self.profiles.read().await.get(&user_id).cloned())
    }

    async fn providers(&self, service_type: &str) -> Result<Vec<UserProfile>, CollaboratorError> {
        self.check_reachable()?;
        let profiles = self.profiles.read().await;
        Ok(profiles
            .values()
            .filter(|p| p.offers(service_type))
            .cloned()
            .collect())
    }
}
