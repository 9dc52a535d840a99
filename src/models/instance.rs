//! # Instance Model
//!
//! A provisioned Redis or Memcached resource as seen by the broker.
//!
//! ## Ownership of Fields
//!
//! Providers build [`Instance`] values from what the backend reports: status, endpoint,
//! engine. Identity and credentials (`id`, `username`, `password`) live only in storage;
//! a provider never fills them in when describing an existing resource. The broker
//! overlays them from the persisted [`Entry`] after every lookup.

use crate::models::plan::ProviderPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Live view of a provisioned resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ProviderPlan>,
    pub username: String,
    pub password: String,
    pub endpoint: String,
    pub status: String,
    pub ready: bool,
    pub engine: String,
    pub engine_version: String,
    pub scheme: String,
}

impl Instance {
    /// Plan id this instance was resolved under, if a plan is attached
    pub fn plan_id(&self) -> Option<&str> {
        self.plan.as_ref().map(|plan| plan.id.as_str())
    }

    /// Overlay the identity and credentials persisted in storage
    pub fn with_entry(mut self, entry: &Entry, plan: ProviderPlan) -> Self {
        self.id = entry.id.clone();
        self.username = entry.username.clone();
        self.password = entry.password.clone();
        self.plan = Some(plan);
        self
    }
}

/// Durable catalog record for an instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: String,
    pub name: String,
    pub plan_id: String,
    pub claimed: bool,
    pub tasks: i32,
    pub status: String,
    pub username: String,
    pub password: String,
    pub endpoint: String,
}

impl Entry {
    /// Build the record to persist for a freshly provisioned instance
    pub fn from_instance(instance: &Instance, plan_id: &str) -> Self {
        Self {
            id: instance.id.clone(),
            name: instance.name.clone(),
            plan_id: plan_id.to_string(),
            claimed: true,
            tasks: 0,
            status: instance.status.clone(),
            username: instance.username.clone(),
            password: instance.password.clone(),
            endpoint: instance.endpoint.clone(),
        }
    }
}

/// A backend-reported metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub key: String,
    pub value: String,
}

impl Stat {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Resource a backup belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
}

/// Point-in-time snapshot descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSpec {
    pub resource: ResourceSpec,
    pub id: String,
    pub progress: i64,
    pub status: String,
    pub created: String,
}

impl BackupSpec {
    /// Textual format used for `created`
    pub const CREATED_FORMAT: &'static str = "%Y-%m-%dT%H:%M:%SZ";

    /// Build a descriptor, deriving progress from the snapshot status
    ///
    /// Snapshots still `creating` report 50%, anything else 100%. A missing creation
    /// time falls back to now.
    pub fn new(
        resource_name: &str,
        snapshot_id: &str,
        status: &str,
        created_at: Option<DateTime<Utc>>,
    ) -> Self {
        let progress = if status == "creating" { 50 } else { 100 };
        let created = created_at
            .unwrap_or_else(Utc::now)
            .format(Self::CREATED_FORMAT)
            .to_string();
        Self {
            resource: ResourceSpec {
                name: resource_name.to_string(),
            },
            id: snapshot_id.to_string(),
            progress,
            status: status.to_string(),
            created,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == "available"
    }
}
