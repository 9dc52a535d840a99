//! # Backend Status Classification
//!
//! Every backend reports lifecycle status in its own vocabulary. This module merges those
//! vocabularies into a handful of protocol-level predicates so the broker never has to
//! know which backend produced a status string.
//!
//! ## Families
//!
//! - [`StatusFamily::CacheCluster`] - RDS/ElastiCache style, lower-case and hyphenated
//! - [`StatusFamily::CloudSql`] - Cloud SQL style, upper-case with underscores
//!
//! Each known status is one row in [`STATUS_TABLE`]. A row carries the traits the
//! predicates read, so adding a status means adding one row rather than editing every
//! predicate. Strings absent from the table are treated as settled but not ready: they are
//! bindable, modifiable and deletable, but never available.
//!
//! Providers may declare synonyms (see [`StatusClassifier::with_synonyms`]) that map
//! their own strings onto a table row.

use std::collections::HashMap;

/// Vocabulary a status string belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFamily {
    CacheCluster,
    CloudSql,
}

/// Trait flags for one status row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTraits {
    /// Fully operational terminal status
    pub available: bool,
    /// Reachable, possibly with background maintenance running
    pub ready: bool,
    /// Transient/mutating status expected to settle on its own
    pub in_progress: bool,
    /// Credentials and endpoint cannot be trusted
    pub bindings_blocked: bool,
    /// Configuration changes are refused
    pub modify_blocked: bool,
    /// Deletion is refused
    pub delete_blocked: bool,
}

impl StatusTraits {
    const fn new() -> Self {
        Self {
            available: false,
            ready: false,
            in_progress: false,
            bindings_blocked: false,
            modify_blocked: false,
            delete_blocked: false,
        }
    }

    const fn available() -> Self {
        Self {
            available: true,
            ready: true,
            ..Self::new()
        }
    }

    /// Reachable while a background optimisation runs
    const fn ready_idle() -> Self {
        Self {
            ready: true,
            ..Self::new()
        }
    }

    /// Reachable while background maintenance runs; mutations wait for it to finish
    const fn ready_busy() -> Self {
        Self {
            ready: true,
            modify_blocked: true,
            delete_blocked: true,
            ..Self::new()
        }
    }

    /// Transient status that still serves credentials
    const fn transitioning() -> Self {
        Self {
            in_progress: true,
            modify_blocked: true,
            delete_blocked: true,
            ..Self::new()
        }
    }

    /// Transient status during which nothing about the resource can be trusted
    const fn transitioning_unbindable() -> Self {
        Self {
            bindings_blocked: true,
            ..Self::transitioning()
        }
    }

    /// Settled but unusable; bindings refused, lifecycle operations still allowed
    const fn down() -> Self {
        Self {
            bindings_blocked: true,
            ..Self::new()
        }
    }

    /// Failure or suspension: nothing may be done until an operator intervenes
    const fn blocked() -> Self {
        Self {
            bindings_blocked: true,
            modify_blocked: true,
            delete_blocked: true,
            ..Self::new()
        }
    }
}

/// One row of the status table
#[derive(Debug, Clone, Copy)]
pub struct StatusRow {
    pub family: StatusFamily,
    pub status: &'static str,
    pub traits: StatusTraits,
}

const fn row(family: StatusFamily, status: &'static str, traits: StatusTraits) -> StatusRow {
    StatusRow {
        family,
        status,
        traits,
    }
}

use StatusFamily::{CacheCluster, CloudSql};

/// Every recognised backend status
pub const STATUS_TABLE: &[StatusRow] = &[
    row(CacheCluster, "available", StatusTraits::available()),
    row(CacheCluster, "creating", StatusTraits::transitioning_unbindable()),
    row(CacheCluster, "starting", StatusTraits::transitioning_unbindable()),
    row(CacheCluster, "modifying", StatusTraits::transitioning()),
    row(CacheCluster, "rebooting", StatusTraits::transitioning()),
    row(CacheCluster, "moving-to-vpc", StatusTraits::transitioning()),
    row(CacheCluster, "renaming", StatusTraits::transitioning()),
    row(CacheCluster, "upgrading", StatusTraits::transitioning()),
    row(CacheCluster, "backtracking", StatusTraits::transitioning()),
    row(CacheCluster, "maintenance", StatusTraits::transitioning()),
    row(CacheCluster, "resetting-master-credentials", StatusTraits::transitioning()),
    row(CacheCluster, "configuring-enhanced-monitoring", StatusTraits::ready_idle()),
    row(CacheCluster, "storage-optimization", StatusTraits::ready_idle()),
    row(CacheCluster, "backing-up", StatusTraits::ready_busy()),
    row(CacheCluster, "stopping", StatusTraits::down()),
    row(CacheCluster, "stopped", StatusTraits::down()),
    row(CacheCluster, "deleting", StatusTraits::down()),
    row(CloudSql, "RUNNABLE", StatusTraits::available()),
    row(CloudSql, "PENDING_CREATE", StatusTraits::transitioning_unbindable()),
    row(CloudSql, "MAINTENANCE", StatusTraits::transitioning_unbindable()),
    row(CloudSql, "SUSPENDED", StatusTraits::blocked()),
    row(CloudSql, "FAILED", StatusTraits::blocked()),
    row(CloudSql, "UNKNOWN_STATE", StatusTraits { ready: true, ..StatusTraits::blocked() }),
];

/// Look up the traits of a status string in the merged table
pub fn lookup(status: &str) -> Option<&'static StatusRow> {
    STATUS_TABLE.iter().find(|row| row.status == status)
}

/// Look up a status string within one family only
pub fn lookup_in(family: StatusFamily, status: &str) -> Option<&'static StatusRow> {
    STATUS_TABLE
        .iter()
        .find(|row| row.family == family && row.status == status)
}

fn traits_of(status: &str) -> StatusTraits {
    lookup(status).map(|row| row.traits).unwrap_or(StatusTraits::new())
}

pub fn is_available(status: &str) -> bool {
    traits_of(status).available
}

pub fn is_ready(status: &str) -> bool {
    traits_of(status).ready
}

pub fn in_progress(status: &str) -> bool {
    traits_of(status).in_progress
}

pub fn can_get_bindings(status: &str) -> bool {
    !traits_of(status).bindings_blocked
}

pub fn can_be_modified(status: &str) -> bool {
    !traits_of(status).modify_blocked
}

pub fn can_be_deleted(status: &str) -> bool {
    !traits_of(status).delete_blocked
}

/// Classifier that resolves provider-declared synonyms before consulting the table
#[derive(Debug, Clone, Default)]
pub struct StatusClassifier {
    synonyms: HashMap<String, &'static StatusRow>,
}

impl StatusClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `alias` means the same as `canonical` in `family`
    ///
    /// Unknown canonical statuses are ignored.
    pub fn with_synonyms<'a>(
        mut self,
        family: StatusFamily,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        for (alias, canonical) in pairs {
            if let Some(row) = lookup_in(family, canonical) {
                self.synonyms.insert(alias.to_string(), row);
            }
        }
        self
    }

    /// The table spelling of `status`, or `status` itself when it is not a synonym
    pub fn canonical<'a>(&self, status: &'a str) -> &'a str {
        match self.synonyms.get(status) {
            Some(row) => row.status,
            None => status,
        }
    }

    fn traits(&self, status: &str) -> StatusTraits {
        self.synonyms
            .get(status)
            .map(|row| row.traits)
            .unwrap_or_else(|| traits_of(status))
    }

    pub fn is_available(&self, status: &str) -> bool {
        self.traits(status).available
    }

    pub fn is_ready(&self, status: &str) -> bool {
        self.traits(status).ready
    }

    pub fn in_progress(&self, status: &str) -> bool {
        self.traits(status).in_progress
    }

    pub fn can_get_bindings(&self, status: &str) -> bool {
        !self.traits(status).bindings_blocked
    }

    pub fn can_be_modified(&self, status: &str) -> bool {
        !self.traits(status).modify_blocked
    }

    pub fn can_be_deleted(&self, status: &str) -> bool {
        !self.traits(status).delete_blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_statuses() {
        assert!(is_available("available"));
        assert!(is_available("RUNNABLE"));
        assert!(!is_available("backing-up"));
        assert!(!is_available("creating"));
        assert!(!is_available("something-new"));
    }

    #[test]
    fn test_ready_statuses() {
        for status in [
            "available",
            "configuring-enhanced-monitoring",
            "storage-optimization",
            "backing-up",
            "RUNNABLE",
            "UNKNOWN_STATE",
        ] {
            assert!(is_ready(status), "{status} should be ready");
        }
        assert!(!is_ready("creating"));
        assert!(!is_ready("FAILED"));
    }

    #[test]
    fn test_in_progress_statuses() {
        for status in [
            "creating",
            "starting",
            "modifying",
            "rebooting",
            "moving-to-vpc",
            "renaming",
            "upgrading",
            "backtracking",
            "maintenance",
            "resetting-master-credentials",
            "PENDING_CREATE",
            "MAINTENANCE",
        ] {
            assert!(in_progress(status), "{status} should be in progress");
        }
        assert!(!in_progress("available"));
        assert!(!in_progress("deleting"));
        assert!(!in_progress("FAILED"));
    }

    #[test]
    fn test_binding_blocked_statuses() {
        for status in [
            "creating",
            "starting",
            "stopping",
            "stopped",
            "deleting",
            "SUSPENDED",
            "PENDING_CREATE",
            "MAINTENANCE",
            "FAILED",
            "UNKNOWN_STATE",
        ] {
            assert!(!can_get_bindings(status), "{status} should block bindings");
        }
        assert!(can_get_bindings("available"));
        assert!(can_get_bindings("modifying"));
        assert!(can_get_bindings("not-in-any-table"));
    }

    #[test]
    fn test_modify_and_delete_blocks() {
        assert!(!can_be_modified("backing-up"));
        assert!(!can_be_deleted("backing-up"));
        assert!(!can_be_modified("FAILED"));
        assert!(!can_be_deleted("SUSPENDED"));
        assert!(can_be_modified("available"));
        assert!(can_be_deleted("stopped"));
    }

    #[test]
    fn test_family_tagged_lookup() {
        assert!(lookup_in(StatusFamily::CloudSql, "maintenance").is_none());
        assert!(lookup_in(StatusFamily::CacheCluster, "maintenance").is_some());
        assert!(lookup_in(StatusFamily::CloudSql, "MAINTENANCE").is_some());
    }

    #[test]
    fn test_table_has_no_duplicate_rows() {
        let mut seen = std::collections::HashSet::new();
        for row in STATUS_TABLE {
            assert!(seen.insert(row.status), "duplicate status row {}", row.status);
        }
    }

    #[test]
    fn test_synonyms_resolve_to_canonical_rows() {
        let classifier = StatusClassifier::new().with_synonyms(
            StatusFamily::CacheCluster,
            [("rollout-complete", "available"), ("rolling", "modifying")],
        );
        assert!(classifier.is_available("rollout-complete"));
        assert!(classifier.in_progress("rolling"));
        assert!(!classifier.can_be_modified("rolling"));
        assert!(classifier.is_available("available"));
        assert_eq!(classifier.canonical("rolling"), "modifying");
        assert_eq!(classifier.canonical("stopped"), "stopped");
    }
}
