use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{info, warn};

use countersign_core::domain::role::RoleCode;
use countersign_core::domain::workflow::{UserId, WorkflowEvent, WorkflowId};

/// Who a notification is addressed to: a named user (signatory steps) or
/// every active holder of a role (ladder steps).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum NotifyTarget {
    User(UserId),
    Role(RoleCode),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub workflow_id: WorkflowId,
    pub correlation_id: String,
    pub event: &'static str,
    pub target: Option<NotifyTarget>,
    pub message: String,
}

impl Notification {
    pub fn for_event(
        workflow_id: WorkflowId,
        correlation_id: String,
        event: WorkflowEvent,
        target: Option<NotifyTarget>,
        message: String,
    ) -> Self {
        Self { workflow_id, correlation_id, event: event.as_str(), target, message }
    }
}

/// Delivery is at-most-once and best-effort: the engine never fails a state
/// transition because a notification could not be sent.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Default gateway: structured log lines only.
#[derive(Clone, Debug, Default)]
pub struct TracingNotificationGateway;

#[async_trait]
impl NotificationGateway for TracingNotificationGateway {
    async fn notify(&self, notification: Notification) {
        info!(
            event_name = "notification.emitted",
            workflow_id = %notification.workflow_id.0,
            correlation_id = %notification.correlation_id,
            event = notification.event,
            target = ?notification.target,
            message = %notification.message,
        );
    }
}

/// Posts each notification as JSON to a configured webhook.
pub struct WebhookNotificationGateway {
    client: reqwest::Client,
    url: String,
    auth_token: Option<SecretString>,
}

impl WebhookNotificationGateway {
    pub fn new(url: String, auth_token: Option<SecretString>) -> Self {
        Self { client: reqwest::Client::new(), url, auth_token }
    }
}

#[async_trait]
impl NotificationGateway for WebhookNotificationGateway {
    async fn notify(&self, notification: Notification) {
        let mut request = self.client.post(&self.url).json(&notification);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!(
                    event_name = "notification.delivered",
                    workflow_id = %notification.workflow_id.0,
                    event = notification.event,
                );
            }
            Ok(response) => {
                warn!(
                    event_name = "notification.delivery_failed",
                    workflow_id = %notification.workflow_id.0,
                    event = notification.event,
                    status = %response.status(),
                );
            }
            Err(error) => {
                warn!(
                    event_name = "notification.delivery_failed",
                    workflow_id = %notification.workflow_id.0,
                    event = notification.event,
                    error = %error,
                );
            }
        }
    }
}
