//! # Broker Tasks
//!
//! Durable follow-up work the broker schedules instead of performing inline. Each task is
//! a `(kind, instance id, metadata)` triple; the metadata is an opaque string whose shape
//! depends on the kind. Delivery is at-least-once, so every executor for these kinds must
//! tolerate running the same task twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of scheduled follow-up work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Remove a backend resource that could not be deleted or recorded synchronously
    Delete,
    /// Resync an instance from its provider once provisioning settles
    PerformPostProvision,
    /// Move an instance to another plan
    ChangePlans,
    /// Restore an instance from a named backup
    RestoreBackup,
    /// Call back the requester once a new instance is ready
    NotifyCreateServiceWebhook,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::PerformPostProvision => "perform-post-provision",
            Self::ChangePlans => "change-plans",
            Self::RestoreBackup => "restore-backup",
            Self::NotifyCreateServiceWebhook => "notify-create-service-webhook",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(Self::Delete),
            "perform-post-provision" => Ok(Self::PerformPostProvision),
            "change-plans" => Ok(Self::ChangePlans),
            "restore-backup" => Ok(Self::RestoreBackup),
            "notify-create-service-webhook" => Ok(Self::NotifyCreateServiceWebhook),
            _ => Err(format!("Invalid task kind: {s}")),
        }
    }
}

/// Lifecycle of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Started,
    Finished,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Queued or running; counts toward the upgrading/restoring markers
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Started)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// A queued task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub instance_id: String,
    pub metadata: String,
    pub status: TaskStatus,
    pub retries: i32,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata for [`TaskKind::Delete`]
///
/// The plan lets the executor reach the backend even when no record was ever written for
/// the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTaskMetadata {
    pub name: String,
    #[serde(default)]
    pub plan: Option<String>,
}

impl DeleteTaskMetadata {
    pub fn new(name: impl Into<String>, plan: Option<&str>) -> Self {
        Self {
            name: name.into(),
            plan: plan.map(str::to_string),
        }
    }

    /// Decode task metadata; a bare resource name is accepted and carries no plan
    pub fn parse(metadata: &str) -> Self {
        serde_json::from_str(metadata).unwrap_or_else(|_| Self::new(metadata, None))
    }
}

/// Metadata for [`TaskKind::ChangePlans`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePlansTaskMetadata {
    pub plan: String,
}

/// Metadata for [`TaskKind::RestoreBackup`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreTaskMetadata {
    pub backup: String,
}

/// Metadata for [`TaskKind::NotifyCreateServiceWebhook`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTaskMetadata {
    pub url: String,
    pub secret: String,
}
