//! # Orchestration Types
//!
//! Requests and responses of the broker verbs. Field names follow the provisioning
//! protocol's JSON vocabulary so an outer transport can serialize them directly.

use crate::models::{BackupSpec, Service, Stat};
use crate::orchestration::actions::ExtensionApi;
use crate::providers::Credentials;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Callback requested with a provision call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    pub secret: String,
}

impl WebhookTarget {
    /// Both url and secret must be present for a callback to be scheduled
    pub fn from_parts(url: Option<&str>, secret: Option<&str>) -> Option<Self> {
        match (url, secret) {
            (Some(url), Some(secret)) if !url.is_empty() && !secret.is_empty() => Some(Self {
                url: url.to_string(),
                secret: secret.to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub plan_id: String,
    pub accepts_incomplete: bool,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub webhook: Option<WebhookTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub exists: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub extension_apis: Vec<ExtensionApi>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeprovisionResponse {
    #[serde(rename = "async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub instance_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateResponse {
    #[serde(rename = "async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperationResponse {
    pub state: OperationState,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BindRequest {
    pub instance_id: String,
    pub binding_id: String,
    #[serde(default)]
    pub app_guid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BindResponse {
    #[serde(rename = "async")]
    pub is_async: bool,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetBindingResponse {
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub services: Vec<Service>,
}

/// Result of an extension action, shaped as the action's JSON body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionResponse {
    Backups(Vec<BackupSpec>),
    Backup(BackupSpec),
    Status { status: String },
    Flushed { flush_all: String },
    Stats { stats: Vec<Stat> },
    Restarted { restart: String },
}
