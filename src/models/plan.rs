//! # Plans and Catalog
//!
//! A [`ProviderPlan`] ties a catalog plan to the backend that fulfills it. The backend's
//! private settings travel with the plan as an opaque JSON blob that only the matching
//! provider decodes.
//!
//! Private settings and the base catalog plan are never serialized: instances carry their
//! plan into webhook payloads and API responses, and the settings may contain network
//! identifiers or credentials.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backend selector declared by a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "aws-redis-instance")]
    AwsRedis,
    #[serde(rename = "aws-memcached-instance")]
    AwsMemcached,
    #[serde(rename = "kubernetes-redis-instance")]
    KubernetesRedis,
    #[serde(rename = "kubernetes-memcached-instance")]
    KubernetesMemcached,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwsRedis => "aws-redis-instance",
            Self::AwsMemcached => "aws-memcached-instance",
            Self::KubernetesRedis => "kubernetes-redis-instance",
            Self::KubernetesMemcached => "kubernetes-memcached-instance",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_kubernetes(&self) -> bool {
        matches!(self, Self::KubernetesRedis | Self::KubernetesMemcached)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = std::convert::Infallible;

    /// Unrecognised selectors parse to [`ProviderKind::Unknown`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "aws-redis-instance" => Self::AwsRedis,
            "aws-memcached-instance" => Self::AwsMemcached,
            "kubernetes-redis-instance" => Self::KubernetesRedis,
            "kubernetes-memcached-instance" => Self::KubernetesMemcached,
            _ => Self::Unknown,
        })
    }
}

/// Catalog metadata for a plan
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogPlan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub free: bool,
}

/// A catalog plan bound to a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPlan {
    pub id: String,
    pub provider: ProviderKind,
    pub scheme: String,
    #[serde(skip)]
    pub base_plan: CatalogPlan,
    #[serde(skip)]
    provider_private_details: String,
}

impl ProviderPlan {
    pub fn new(
        id: impl Into<String>,
        provider: ProviderKind,
        scheme: impl Into<String>,
        provider_private_details: impl Into<String>,
        base_plan: CatalogPlan,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            scheme: scheme.into(),
            base_plan,
            provider_private_details: provider_private_details.into(),
        }
    }

    /// Raw backend settings; only the provider for `self.provider` should read these
    pub fn private_details(&self) -> &str {
        &self.provider_private_details
    }

    /// Decode the backend settings into the provider's settings type
    pub fn settings<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.provider_private_details)
    }
}

/// A catalog service with its plans
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plan_updateable: bool,
    pub plans: Vec<CatalogPlan>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!(
            "aws-redis-instance".parse::<ProviderKind>().unwrap(),
            ProviderKind::AwsRedis
        );
        assert_eq!(
            "kubernetes-memcached-instance".parse::<ProviderKind>().unwrap(),
            ProviderKind::KubernetesMemcached
        );
        assert_eq!(
            "gcloud-something".parse::<ProviderKind>().unwrap(),
            ProviderKind::Unknown
        );
        assert!(ProviderKind::KubernetesRedis.is_kubernetes());
        assert!(!ProviderKind::AwsMemcached.is_kubernetes());
    }

    #[test]
    fn test_private_details_never_serialized() {
        let plan = ProviderPlan::new(
            "plan-1",
            ProviderKind::AwsRedis,
            "redis",
            r#"{"CacheNodeType":"cache.t2.micro","SecurityGroupIds":["sg-123"]}"#,
            CatalogPlan::default(),
        );
        let json = serde_json::to_string(&plan).unwrap();
        assert!(!json.contains("sg-123"));
        assert!(json.contains("aws-redis-instance"));
    }
}
