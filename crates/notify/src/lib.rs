use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// One operator-facing alert. Severity maps onto how the receiving channel
/// renders it; the engine only ever raises `Error` today.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook endpoint returned status {0}")]
    BadStatus(u16),
}

/// Delivery channel for operator alerts. Failures here must never fail the
/// operation that raised the alert; callers log and move on.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Posts notifications to a JSON webhook endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await
            .with_context(|| format!("post notification to {}", self.endpoint))?;
        if !response.status().is_success() {
            return Err(NotifyError::BadStatus(response.status().as_u16()).into());
        }
        Ok(())
    }
}

/// Fallback channel when no webhook is configured: alerts land in the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        warn!(
            subject = %notification.subject,
            severity = ?notification.severity,
            "operator notification: {}",
            notification.body
        );
        Ok(())
    }
}
