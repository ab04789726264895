// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use mutua::application::{
    Collaborators, CommandContext, EngineConfig, RetryPolicy, TransactionEngine,
};
use mutua::collaborators::{
    ArbiterRoster, ChannelNotifier, NotificationSink, OutboundEvent, StaticDirectory,
};
use mutua::domain::{
    Actor, Credits, MatchPolicy, ServiceRequest, UserId, UserProfile, VerificationLevel,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Members of the test exchange
pub struct Members {
    pub requester: UserId,
    /// Highest rated tutor
    pub provider: UserId,
    /// Second tutor
    pub backup: UserId,
    pub arbiter: UserId,
}

/// An engine on a temporary database, with an in-memory directory and a
/// channel capturing outbound events.
pub struct Exchange {
    pub engine: TransactionEngine,
    pub directory: StaticDirectory,
    pub events: UnboundedReceiver<OutboundEvent>,
    pub members: Members,
    pub db_path: PathBuf,
    pub config: EngineConfig,
}

pub fn profile(user_id: UserId, rating: f64, services: &[&str], joined_year: i32) -> UserProfile {
    UserProfile {
        user_id,
        is_active: true,
        verification_level: VerificationLevel::Standard,
        average_rating: rating,
        services_completed: 10,
        service_types: services.iter().map(|s| s.to_string()).collect(),
        created_at: Utc.with_ymd_and_hms(joined_year, 1, 1, 0, 0, 0).unwrap(),
    }
}

/// Retries quickly so contention tests stay fast.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        request_timeout: Duration::from_secs(3600),
        sweep_interval: Duration::from_millis(50),
        retry: RetryPolicy {
            max_attempts: 25,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(40),
        },
        matching: MatchPolicy::default(),
    }
}

/// Helper to create a test exchange with a temporary database
pub async fn test_exchange() -> Result<(Exchange, TempDir)> {
    test_exchange_with(test_config()).await
}

pub async fn test_exchange_with(config: EngineConfig) -> Result<(Exchange, TempDir)> {
    let (notifier, events) = ChannelNotifier::channel();
    build_exchange(config, Arc::new(notifier), events).await
}

/// An exchange publishing through `notifier`. Its `events` channel stays
/// empty.
pub async fn test_exchange_with_notifier(
    config: EngineConfig,
    notifier: Arc<dyn NotificationSink>,
) -> Result<(Exchange, TempDir)> {
    let (_unused, events) = ChannelNotifier::channel();
    build_exchange(config, notifier, events).await
}

async fn build_exchange(
    config: EngineConfig,
    notifier: Arc<dyn NotificationSink>,
    events: UnboundedReceiver<OutboundEvent>,
) -> Result<(Exchange, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");

    let members = Members {
        requester: Uuid::new_v4(),
        provider: Uuid::new_v4(),
        backup: Uuid::new_v4(),
        arbiter: Uuid::new_v4(),
    };
    let directory = StaticDirectory::from_profiles([
        profile(members.requester, 4.0, &[], 2020),
        profile(members.provider, 4.9, &["tutoring", "gardening"], 2021),
        profile(members.backup, 4.2, &["tutoring"], 2019),
        profile(members.arbiter, 5.0, &[], 2018),
    ]);

    let collaborators = Collaborators {
        directory: Arc::new(directory.clone()),
        notifier,
        arbitration: Arc::new(ArbiterRoster::new([members.arbiter])),
    };
    let engine =
        TransactionEngine::init(db_path.to_str().unwrap(), collaborators, config.clone()).await?;

    Ok((
        Exchange {
            engine,
            directory,
            events,
            members,
            db_path,
            config,
        },
        temp_dir,
    ))
}

/// Open a second engine on an existing database.
pub async fn reopen(db_path: &Path, directory: StaticDirectory) -> Result<TransactionEngine> {
    let (notifier, _events) = ChannelNotifier::channel();
    let collaborators = Collaborators {
        directory: Arc::new(directory),
        notifier: Arc::new(notifier),
        arbitration: Arc::new(ArbiterRoster::empty()),
    };
    Ok(TransactionEngine::connect(db_path.to_str().unwrap(), collaborators, test_config()).await?)
}

pub fn as_user(user_id: UserId) -> CommandContext {
    CommandContext::fresh(Actor::User(user_id))
}

pub fn as_system() -> CommandContext {
    CommandContext::fresh(Actor::System)
}

impl Exchange {
    pub async fn grant(&self, user_id: UserId, amount: Credits) -> Result<()> {
        self.engine
            .grant_credits(&as_system(), user_id, amount)
            .await?;
        Ok(())
    }

    /// Fund the requester and create a tutoring request.
    pub async fn funded_request(&self, funds: Credits, amount: Credits) -> Result<ServiceRequest> {
        self.grant(self.members.requester, funds).await?;
        Ok(self
            .engine
            .create_request(&as_user(self.members.requester), "tutoring", amount, None)
            .await?)
    }

    /// Create a funded request and match it with the given provider.
    pub async fn matched_request(&self, funds: Credits, amount: Credits) -> Result<ServiceRequest> {
        let request = self.funded_request(funds, amount).await?;
        Ok(self
            .engine
            .match_request(
                &as_user(self.members.requester),
                request.id,
                Some(self.members.provider),
            )
            .await?)
    }

    /// Drive a request up to IN_PROGRESS.
    pub async fn request_in_progress(
        &self,
        funds: Credits,
        amount: Credits,
    ) -> Result<ServiceRequest> {
        let request = self.matched_request(funds, amount).await?;
        let provider = as_user(self.members.provider);
        self.engine.accept_request(&provider, request.id).await?;
        Ok(self
            .engine
            .start_request(&as_user(self.members.provider), request.id)
            .await?)
    }

    /// Events published so far, in order.
    pub fn drain_events(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
