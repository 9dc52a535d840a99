//! # Extension Actions
//!
//! Instance-scoped operations offered beyond the provisioning protocol. Each action has a
//! method and a path template relative to the instance's actions root; provision responses
//! advertise them so clients can discover backup, flush, stats and restart support.
//!
//! | Action           | Method | Path               |
//! |------------------|--------|--------------------|
//! | `list_backups`   | GET    | `backups`          |
//! | `get_backup`     | GET    | `backups/{backup}` |
//! | `create_backup`  | POST   | `backups`          |
//! | `restore_backup` | PUT    | `backups/{backup}` |
//! | `flush`          | POST   | `flush`            |
//! | `stats`          | POST   | `stats`            |
//! | `restart`        | POST   | `restart`          |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            _ => Err(format!("Unsupported method: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ListBackups,
    GetBackup,
    CreateBackup,
    RestoreBackup,
    Flush,
    Stats,
    Restart,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListBackups => "list_backups",
            Self::GetBackup => "get_backup",
            Self::CreateBackup => "create_backup",
            Self::RestoreBackup => "restore_backup",
            Self::Flush => "flush",
            Self::Stats => "stats",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionAction {
    pub kind: ActionKind,
    pub path: String,
    pub method: HttpMethod,
}

impl ExtensionAction {
    /// Match a concrete relative path against this action's template, capturing `{vars}`
    pub fn matches(&self, method: HttpMethod, path: &str) -> Option<HashMap<String, String>> {
        if method != self.method {
            return None;
        }
        let template: Vec<&str> = self.path.trim_matches('/').split('/').collect();
        let actual: Vec<&str> = path.trim_matches('/').split('/').collect();
        if template.len() != actual.len() {
            return None;
        }

        let mut vars = HashMap::new();
        for (expected, segment) in template.iter().zip(actual.iter()) {
            match expected
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(var) if !segment.is_empty() => {
                    vars.insert(var.to_string(), segment.to_string());
                }
                Some(_) => return None,
                None if expected == segment => {}
                None => return None,
            }
        }
        Some(vars)
    }
}

/// Advertised description of an action for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionApi {
    pub name: String,
    pub method: HttpMethod,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ActionRegistry {
    actions: Vec<ExtensionAction>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        let mut registry = Self {
            actions: Vec::new(),
        };
        registry.add(ActionKind::ListBackups, "backups", HttpMethod::Get);
        registry.add(ActionKind::GetBackup, "backups/{backup}", HttpMethod::Get);
        registry.add(ActionKind::CreateBackup, "backups", HttpMethod::Post);
        registry.add(ActionKind::RestoreBackup, "backups/{backup}", HttpMethod::Put);
        registry.add(ActionKind::Flush, "flush", HttpMethod::Post);
        registry.add(ActionKind::Stats, "stats", HttpMethod::Post);
        registry.add(ActionKind::Restart, "restart", HttpMethod::Post);
        registry
    }
}

impl ActionRegistry {
    pub fn add(&mut self, kind: ActionKind, path: &str, method: HttpMethod) {
        self.actions.push(ExtensionAction {
            kind,
            path: path.to_string(),
            method,
        });
    }

    pub fn actions(&self) -> &[ExtensionAction] {
        &self.actions
    }

    /// Resolve a request against the registered templates
    pub fn route(&self, method: HttpMethod, path: &str) -> Option<(ActionKind, HashMap<String, String>)> {
        self.actions
            .iter()
            .find_map(|action| action.matches(method, path).map(|vars| (action.kind, vars)))
    }

    /// Actions as advertised for `instance_id`
    pub fn extension_apis(&self, instance_id: &str) -> Vec<ExtensionApi> {
        self.actions
            .iter()
            .map(|action| ExtensionApi {
                name: action.kind.as_str().to_string(),
                method: action.method,
                path: format!("/v2/service_instances/{instance_id}/actions/{}", action.path),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_captures_backup_id() {
        let registry = ActionRegistry::default();
        let (kind, vars) = registry
            .route(HttpMethod::Put, "backups/cacheabc-manual-x1")
            .unwrap();
        assert_eq!(kind, ActionKind::RestoreBackup);
        assert_eq!(vars.get("backup").unwrap(), "cacheabc-manual-x1");

        let (kind, vars) = registry.route(HttpMethod::Get, "/backups/").unwrap();
        assert_eq!(kind, ActionKind::ListBackups);
        assert!(vars.is_empty());

        assert!(registry.route(HttpMethod::Put, "flush").is_none());
        assert!(registry.route(HttpMethod::Get, "backups/a/b").is_none());
    }

    #[test]
    fn test_extension_apis_cover_every_action() {
        let apis = ActionRegistry::default().extension_apis("instance-1");
        assert_eq!(apis.len(), 7);
        let restore = apis.iter().find(|api| api.name == "restore_backup").unwrap();
        assert_eq!(restore.method, HttpMethod::Put);
        assert_eq!(
            restore.path,
            "/v2/service_instances/instance-1/actions/backups/{backup}"
        );
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert!("DELETE".parse::<HttpMethod>().is_err());
    }
}
