//! Audit timeline and terminal notifications.
//!
//! Every transition the dispatcher applies is written here as an immutable
//! [`AuditEntry`]; terminal transaction outcomes additionally go out through
//! [`AuditSink::notify`], exactly once per transaction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NotifyError;

/// One immutable timeline record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub owner_id: String,
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutcome {
    Success,
    Failure,
}

impl std::fmt::Display for NotificationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationOutcome::Success => write!(f, "success"),
            NotificationOutcome::Failure => write!(f, "failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub owner_id: String,
    pub outcome: NotificationOutcome,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_audit_entry(
        &self,
        owner_id: &str,
        status: &str,
        message: &str,
        remarks: Option<Value>,
    ) -> Result<(), NotifyError>;

    async fn notify(&self, owner_id: &str, outcome: NotificationOutcome, detail: &str) -> Result<(), NotifyError>;
}

/// Keeps timelines in memory, in append order per owner.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    timelines: DashMap<String, Vec<AuditEntry>>,
    notifications: RwLock<Vec<Notification>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline(&self, owner_id: &str) -> Vec<AuditEntry> {
        self.timelines
            .get(owner_id)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Statuses of an owner's timeline, oldest first.
    pub fn statuses(&self, owner_id: &str) -> Vec<String> {
        self.timeline(owner_id).into_iter().map(|e| e.status).collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().clone()
    }

    pub fn notifications_for(&self, owner_id: &str) -> Vec<Notification> {
        self.notifications
            .read()
            .iter()
            .filter(|n| n.owner_id == owner_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn write_audit_entry(
        &self,
        owner_id: &str,
        status: &str,
        message: &str,
        remarks: Option<Value>,
    ) -> Result<(), NotifyError> {
        let entry = AuditEntry {
            owner_id: owner_id.to_string(),
            status: status.to_string(),
            message: message.to_string(),
            remarks,
            timestamp: Utc::now(),
        };
        self.timelines.entry(owner_id.to_string()).or_default().push(entry);
        Ok(())
    }

    async fn notify(&self, owner_id: &str, outcome: NotificationOutcome, detail: &str) -> Result<(), NotifyError> {
        self.notifications.write().push(Notification {
            owner_id: owner_id.to_string(),
            outcome,
            detail: detail.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// Forwards audit entries to an inner sink and additionally POSTs every
/// terminal notification as JSON to a webhook.
pub struct WebhookNotifier {
    inner: Arc<dyn AuditSink>,
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(inner: Arc<dyn AuditSink>, url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            inner,
            client,
            url: url.into(),
        })
    }

    async fn post(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(NotifyError::Endpoint {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for WebhookNotifier {
    async fn write_audit_entry(
        &self,
        owner_id: &str,
        status: &str,
        message: &str,
        remarks: Option<Value>,
    ) -> Result<(), NotifyError> {
        self.inner.write_audit_entry(owner_id, status, message, remarks).await
    }

    async fn notify(&self, owner_id: &str, outcome: NotificationOutcome, detail: &str) -> Result<(), NotifyError> {
        self.inner.notify(owner_id, outcome, detail).await?;
        let notification = Notification {
            owner_id: owner_id.to_string(),
            outcome,
            detail: detail.to_string(),
            timestamp: Utc::now(),
        };
        self.post(&notification).await?;
        tracing::info!(owner_id, outcome = %outcome, url = %self.url, "notification delivered");
        Ok(())
    }
}
