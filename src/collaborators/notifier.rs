use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::CollaboratorError;
use crate::domain::{RequestId, UserId};

/// An event published after a command commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    /// e.g. `request.matched`, `credits.received`
    pub event_type: String,
    pub request_id: Option<RequestId>,
    /// The member who should be told
    pub target_user: UserId,
    pub payload: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(
        event_type: impl Into<String>,
        request_id: Option<RequestId>,
        target_user: UserId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            request_id,
            target_user,
            payload,
        }
    }
}

/// Outbound notification service. Delivery is best-effort: the engine never
/// rolls back a committed command because publishing failed.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<(), CollaboratorError>;
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn publish(&self, event: &OutboundEvent) -> Result<(), CollaboratorError> {
        tracing::info!(
            event_type = %event.event_type,
            request_id = ?event.request_id,
            target_user = %event.target_user,
            payload = %event.payload,
            "notification"
        );
        Ok(())
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn publish(&self, event: &OutboundEvent) -> Result<(), CollaboratorError> {
        self.sender
            .send(event.clone())
            .map_err(|_| CollaboratorError::new("notifications", "receiver dropped"))
    }
}
