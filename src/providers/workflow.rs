//! # Recorded Multi-Step Workflows
//!
//! Restore and recreate-style modification are sequences of backend calls with no
//! transactional envelope. A failure part way through leaves the backend in an
//! intermediate state, so each step is recorded as it completes and a failure reports
//! both the step that failed and the last one that succeeded. Operators recover from that
//! report by hand; there is no automatic rollback.
//!
//! ```text
//! restore-backup:  verify-backup -> delete-cluster -> await-deletion
//!                  -> recreate-from-snapshot -> await-available
//! recreate-modify: read-owner -> deprovision -> await-deletion -> provision
//! ```

use crate::error::{ProviderError, ProviderResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tracing::{debug, error, info};

/// Which multi-step operation is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    RestoreBackup,
    RecreateModify,
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestoreBackup => write!(f, "restore-backup"),
            Self::RecreateModify => write!(f, "recreate-modify"),
        }
    }
}

/// A single recorded step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStep {
    /// Confirm the named snapshot exists
    VerifyBackup,
    /// Delete the live cluster, taking a safety snapshot
    DeleteCluster,
    /// Poll until the backend no longer reports the resource
    AwaitDeletion,
    /// Create the cluster again, seeded from the snapshot
    RecreateFromSnapshot,
    /// Poll until the recreated cluster is available
    AwaitAvailable,
    /// Read settings that must survive the recreate (owner annotation)
    ReadOwner,
    /// Remove the existing resource
    Deprovision,
    /// Create the resource under its existing identifier
    Provision,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::VerifyBackup => "verify-backup",
            Self::DeleteCluster => "delete-cluster",
            Self::AwaitDeletion => "await-deletion",
            Self::RecreateFromSnapshot => "recreate-from-snapshot",
            Self::AwaitAvailable => "await-available",
            Self::ReadOwner => "read-owner",
            Self::Deprovision => "deprovision",
            Self::Provision => "provision",
        };
        write!(f, "{name}")
    }
}

/// Report of a workflow that stopped part way through
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowFailure {
    pub workflow: WorkflowKind,
    pub resource: String,
    pub failed_step: WorkflowStep,
    pub last_completed: Option<WorkflowStep>,
    pub cause: ProviderError,
}

impl WorkflowFailure {
    /// True when the workflow failed before changing anything on the backend
    pub fn is_untouched(&self) -> bool {
        self.last_completed.is_none()
    }
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self
            .last_completed
            .map(|step| step.to_string())
            .unwrap_or_else(|| "none".to_string());
        write!(
            f,
            "{} of {} failed at step {} (last completed: {}): {}",
            self.workflow, self.resource, self.failed_step, last, self.cause
        )
    }
}

/// Step-by-step progress tracker for one workflow run
#[derive(Debug)]
pub struct WorkflowProgress {
    workflow: WorkflowKind,
    resource: String,
    completed: Vec<WorkflowStep>,
}

impl WorkflowProgress {
    pub fn new(workflow: WorkflowKind, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        info!(workflow = %workflow, resource = %resource, "🔄 Starting workflow");
        Self {
            workflow,
            resource,
            completed: Vec::new(),
        }
    }

    /// Run one step; on error, stop and describe where the workflow got to
    pub async fn step<T, Fut>(&mut self, step: WorkflowStep, fut: Fut) -> Result<T, WorkflowFailure>
    where
        Fut: Future<Output = ProviderResult<T>>,
    {
        debug!(workflow = %self.workflow, resource = %self.resource, step = %step, "Running workflow step");
        match fut.await {
            Ok(value) => {
                self.completed.push(step);
                Ok(value)
            }
            Err(cause) => {
                let failure = WorkflowFailure {
                    workflow: self.workflow,
                    resource: self.resource.clone(),
                    failed_step: step,
                    last_completed: self.last_completed(),
                    cause,
                };
                error!(
                    workflow = %failure.workflow,
                    resource = %failure.resource,
                    failed_step = %failure.failed_step,
                    last_completed = ?failure.last_completed,
                    error = %failure.cause,
                    "❌ Workflow stopped; backend may be left in an intermediate state"
                );
                Err(failure)
            }
        }
    }

    pub fn last_completed(&self) -> Option<WorkflowStep> {
        self.completed.last().copied()
    }

    pub fn completed(&self) -> &[WorkflowStep] {
        &self.completed
    }

    /// Mark the run finished and log the recorded steps
    pub fn finish(self) {
        info!(
            workflow = %self.workflow,
            resource = %self.resource,
            steps = self.completed.len(),
            "✅ Workflow completed"
        );
    }
}
