//! Single-task executor.
//!
//! Each run yields a [`TaskOutcome`]. Retries put the task back in the queue as pending
//! with its retry counter bumped, until the kind's retry budget is spent. A workflow that
//! failed after changing the backend is never retried: repeating it from the first step
//! could destroy the safety snapshot it already took.

use crate::error::{LookupError, ProviderError};
use crate::logging::log_orphan;
use crate::models::{
    ChangePlansTaskMetadata, DeleteTaskMetadata, Instance, RestoreTaskMetadata, Task, TaskKind,
    TaskStatus, WebhookTaskMetadata,
};
use crate::providers::ProviderRegistry;
use crate::status;
use crate::storage::Storage;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Retry budget for most kinds
pub const DEFAULT_MAX_RETRIES: i32 = 10;

/// Retry budget for kinds that wait on a slow backend
pub const WAITING_MAX_RETRIES: i32 = 60;

pub const WEBHOOK_SECRET_HEADER: &str = "X-Webhook-Secret";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished(String),
    Retry(String),
    Failed(String),
}

impl TaskOutcome {
    fn retry(reason: impl fmt::Display) -> Self {
        Self::Retry(reason.to_string())
    }

    /// Classify a provider failure: partial workflows and missing resources fail for good,
    /// the rest retry
    fn from_provider_error(error: &ProviderError) -> Self {
        match error {
            ProviderError::Workflow(failure) if !failure.is_untouched() => {
                Self::Failed(error.to_string())
            }
            error if error.is_not_found() => Self::Failed(error.to_string()),
            _ => Self::Retry(error.to_string()),
        }
    }
}

/// Body posted to a create webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookNotification {
    pub instance_id: String,
    pub state: String,
    pub description: String,
}

fn max_retries(kind: TaskKind) -> i32 {
    match kind {
        TaskKind::PerformPostProvision | TaskKind::NotifyCreateServiceWebhook => {
            WAITING_MAX_RETRIES
        }
        _ => DEFAULT_MAX_RETRIES,
    }
}

#[derive(Debug, Clone)]
pub struct TaskExecutor {
    storage: Arc<dyn Storage>,
    providers: ProviderRegistry,
    http: reqwest::Client,
}

impl TaskExecutor {
    pub fn new(storage: Arc<dyn Storage>, providers: ProviderRegistry) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            storage,
            providers,
            http,
        }
    }

    /// Dequeue and run one task, returning it with its recorded outcome
    ///
    /// `Ok(None)` when the queue is empty.
    pub async fn run_next(&self) -> Result<Option<Task>, crate::error::StorageError> {
        let Some(mut task) = self.storage.pop_task().await? else {
            return Ok(None);
        };

        let outcome = self.execute(&task).await;
        let (status, retries, result) = match outcome {
            TaskOutcome::Finished(result) => (TaskStatus::Finished, task.retries, result),
            TaskOutcome::Failed(result) => (TaskStatus::Failed, task.retries, result),
            TaskOutcome::Retry(result) if task.retries + 1 >= max_retries(task.kind) => {
                (TaskStatus::Failed, task.retries + 1, format!("retries exhausted: {result}"))
            }
            TaskOutcome::Retry(result) => (TaskStatus::Pending, task.retries + 1, result),
        };

        match status {
            TaskStatus::Failed => error!(
                task_id = %task.id,
                kind = %task.kind,
                instance_id = %task.instance_id,
                retries = retries,
                result = %result,
                "❌ Task failed"
            ),
            TaskStatus::Pending => debug!(
                task_id = %task.id,
                kind = %task.kind,
                retries = retries,
                result = %result,
                "Task will be retried"
            ),
            _ => info!(
                task_id = %task.id,
                kind = %task.kind,
                instance_id = %task.instance_id,
                "✅ Task finished"
            ),
        }

        self.storage
            .finish_task(&task.id, status, retries, &result)
            .await?;
        task.status = status;
        task.retries = retries;
        task.result = Some(result);
        Ok(Some(task))
    }

    /// Run a task without touching its queue state
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind, instance_id = %task.instance_id))]
    pub async fn execute(&self, task: &Task) -> TaskOutcome {
        match task.kind {
            TaskKind::Delete => self.delete(task).await,
            TaskKind::PerformPostProvision => self.post_provision(task).await,
            TaskKind::ChangePlans => self.change_plans(task).await,
            TaskKind::RestoreBackup => self.restore_backup(task).await,
            TaskKind::NotifyCreateServiceWebhook => self.notify_webhook(task).await,
        }
    }

    async fn resolve(&self, instance_id: &str) -> Result<Instance, LookupError> {
        let entry = self.storage.get_instance(instance_id).await?;
        let plan = self.storage.get_plan_by_id(&entry.plan_id).await?;
        let provider = self.providers.provider_for(&plan)?;
        let instance = provider.get_instance(&entry.name, &plan).await?;
        Ok(instance.with_entry(&entry, plan))
    }

    async fn delete(&self, task: &Task) -> TaskOutcome {
        let metadata = DeleteTaskMetadata::parse(&task.metadata);
        let entry = match self.storage.get_instance(&task.instance_id).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return self.delete_unrecorded(task, &metadata).await,
            Err(e) => return TaskOutcome::retry(e),
        };
        let plan = match self.storage.get_plan_by_id(&entry.plan_id).await {
            Ok(plan) => plan,
            Err(e) => return TaskOutcome::retry(e),
        };
        let provider = match self.providers.provider_for(&plan) {
            Ok(provider) => provider,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        match provider.get_instance(&entry.name, &plan).await {
            Ok(instance) => {
                let instance = instance.with_entry(&entry, plan);
                if !status::can_be_deleted(&instance.status) {
                    return TaskOutcome::Retry(format!("status is {}", instance.status));
                }
                if let Err(e) = provider.deprovision(&instance, true).await {
                    return TaskOutcome::from_provider_error(&e);
                }
                match self.storage.delete_instance(&instance).await {
                    Ok(()) => TaskOutcome::Finished(format!("deleted {}", instance.name)),
                    Err(e) => TaskOutcome::retry(e),
                }
            }
            Err(e) if e.is_not_found() => {
                // Already gone on the backend; only the record remains.
                let instance = Instance {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                    plan: Some(plan),
                    ..Instance::default()
                };
                match self.storage.delete_instance(&instance).await {
                    Ok(()) => TaskOutcome::Finished(format!("{} was already removed", entry.name)),
                    Err(e) => TaskOutcome::retry(e),
                }
            }
            Err(e) => TaskOutcome::retry(e),
        }
    }

    /// Remove a resource that has no record, looked up by name under the task's plan
    async fn delete_unrecorded(&self, task: &Task, metadata: &DeleteTaskMetadata) -> TaskOutcome {
        let orphaned = |reason: String| {
            log_orphan(&task.instance_id, &metadata.name, &reason);
            TaskOutcome::Failed(reason)
        };
        let Some(plan_id) = metadata.plan.as_deref() else {
            return orphaned(format!("no record or plan for {}", metadata.name));
        };
        let plan = match self.storage.get_plan_by_id(plan_id).await {
            Ok(plan) => plan,
            Err(e) if e.is_not_found() => return orphaned(e.to_string()),
            Err(e) => return TaskOutcome::retry(e),
        };
        let provider = match self.providers.provider_for(&plan) {
            Ok(provider) => provider,
            Err(e) => return orphaned(e.to_string()),
        };

        let instance = match provider.get_instance(&metadata.name, &plan).await {
            Ok(instance) => Instance {
                id: task.instance_id.clone(),
                plan: Some(plan),
                ..instance
            },
            Err(e) if e.is_not_found() => {
                return TaskOutcome::Finished(format!("{} was already removed", metadata.name))
            }
            Err(e) => return TaskOutcome::retry(e),
        };
        if !status::can_be_deleted(&instance.status) {
            return TaskOutcome::Retry(format!("status is {}", instance.status));
        }
        match provider.deprovision(&instance, false).await {
            Ok(()) => {
                info!(
                    instance_id = %task.instance_id,
                    name = %metadata.name,
                    "🧹 Unrecorded resource removed"
                );
                TaskOutcome::Finished(format!("deleted unrecorded {}", metadata.name))
            }
            Err(e) => TaskOutcome::from_provider_error(&e),
        }
    }

    async fn post_provision(&self, task: &Task) -> TaskOutcome {
        let instance = match self.resolve(&task.instance_id).await {
            Ok(instance) => instance,
            Err(e) => return TaskOutcome::retry(e),
        };
        if !instance.ready {
            return TaskOutcome::Retry(format!("status is {}", instance.status));
        }
        let plan_id = instance.plan_id().unwrap_or_default().to_string();
        let provider = match self.providers.provider_for_instance(&instance) {
            Ok(provider) => provider,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        let updated = match provider.perform_post_provision(&instance).await {
            Ok(updated) => updated,
            Err(e) => return TaskOutcome::from_provider_error(&e),
        };
        match self.storage.update_instance(&updated, &plan_id).await {
            Ok(()) => TaskOutcome::Finished(format!("status {}", updated.status)),
            Err(e) => TaskOutcome::retry(e),
        }
    }

    async fn change_plans(&self, task: &Task) -> TaskOutcome {
        let metadata: ChangePlansTaskMetadata = match serde_json::from_str(&task.metadata) {
            Ok(metadata) => metadata,
            Err(e) => return TaskOutcome::Failed(format!("invalid metadata: {e}")),
        };
        let target = match self.storage.get_plan_by_id(&metadata.plan).await {
            Ok(plan) => plan,
            Err(e) if e.is_not_found() => return TaskOutcome::Failed(e.to_string()),
            Err(e) => return TaskOutcome::retry(e),
        };
        let instance = match self.resolve(&task.instance_id).await {
            Ok(instance) => instance,
            Err(e) => return TaskOutcome::retry(e),
        };
        if instance.plan_id() == Some(target.id.as_str()) {
            return TaskOutcome::Finished(format!("already on plan {}", target.id));
        }
        if !status::can_be_modified(&instance.status) {
            return TaskOutcome::Retry(format!("status is {}", instance.status));
        }

        let current = match self.providers.provider_for_instance(&instance) {
            Ok(provider) => provider,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };
        let next = match self.providers.provider_for(&target) {
            Ok(provider) => provider,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        if current.kind() == next.kind() {
            let modified = match current.modify(&instance, &target).await {
                Ok(modified) => modified,
                Err(e) => return TaskOutcome::from_provider_error(&e),
            };
            // The resource keeps its name, so only the plan changes on the record.
            return match self.storage.update_plan(&instance.id, &target.id).await {
                Ok(()) => TaskOutcome::Finished(format!("moved to plan {} ({})", target.id, modified.status)),
                Err(e) => {
                    error!(
                        instance_id = %instance.id,
                        plan_id = %target.id,
                        error = %e,
                        "Plan changed on the backend but the record was not updated"
                    );
                    TaskOutcome::retry(e)
                }
            };
        }

        info!(
            instance_id = %instance.id,
            from = %current.kind(),
            to = %next.kind(),
            "🔀 Moving instance across providers"
        );
        let mut replacement = match next.provision(&instance.id, &target, "").await {
            Ok(replacement) => replacement,
            Err(e) => return TaskOutcome::retry(e),
        };
        replacement.id = instance.id.clone();
        replacement.plan = Some(target.clone());

        if let Err(e) = self.storage.update_instance(&replacement, &target.id).await {
            error!(
                instance_id = %instance.id,
                name = %replacement.name,
                error = %e,
                "Unable to record replacement instance, removing it"
            );
            if let Err(cleanup) = next.deprovision(&replacement, false).await {
                log_orphan(&instance.id, &replacement.name, &cleanup.to_string());
            }
            return TaskOutcome::retry(e);
        }

        if let Err(e) = current.deprovision(&instance, false).await {
            log_orphan(&instance.id, &instance.name, &e.to_string());
        }
        TaskOutcome::Finished(format!("moved to plan {} as {}", target.id, replacement.name))
    }

    async fn restore_backup(&self, task: &Task) -> TaskOutcome {
        let metadata: RestoreTaskMetadata = match serde_json::from_str(&task.metadata) {
            Ok(metadata) => metadata,
            Err(e) => return TaskOutcome::Failed(format!("invalid metadata: {e}")),
        };
        let instance = match self.resolve(&task.instance_id).await {
            Ok(instance) => instance,
            Err(e) => return TaskOutcome::retry(e),
        };
        if !status::can_be_modified(&instance.status) {
            return TaskOutcome::Retry(format!("status is {}", instance.status));
        }
        let provider = match self.providers.provider_for_instance(&instance) {
            Ok(provider) => provider,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        match provider.restore_backup(&instance, &metadata.backup).await {
            Ok(()) => TaskOutcome::Finished(format!("restored from {}", metadata.backup)),
            Err(ProviderError::Unsupported(reason)) => TaskOutcome::Failed(reason),
            Err(e) => TaskOutcome::from_provider_error(&e),
        }
    }

    async fn notify_webhook(&self, task: &Task) -> TaskOutcome {
        let metadata: WebhookTaskMetadata = match serde_json::from_str(&task.metadata) {
            Ok(metadata) => metadata,
            Err(e) => return TaskOutcome::Failed(format!("invalid metadata: {e}")),
        };
        let instance = match self.resolve(&task.instance_id).await {
            Ok(instance) => instance,
            Err(e) => return TaskOutcome::retry(e),
        };
        if !instance.ready {
            return TaskOutcome::Retry(format!("status is {}", instance.status));
        }

        let body = WebhookNotification {
            instance_id: instance.id.clone(),
            state: "succeeded".to_string(),
            description: instance.status.clone(),
        };
        let response = self
            .http
            .post(&metadata.url)
            .header(WEBHOOK_SECRET_HEADER, &metadata.secret)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                TaskOutcome::Finished(format!("notified {}", metadata.url))
            }
            Ok(response) => {
                warn!(url = %metadata.url, status = %response.status(), "Webhook rejected notification");
                TaskOutcome::Retry(format!("webhook returned {}", response.status()))
            }
            Err(e) => TaskOutcome::retry(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::workflow::{WorkflowKind, WorkflowStep};
    use crate::providers::WorkflowFailure;

    #[test]
    fn test_retry_budgets() {
        assert_eq!(max_retries(TaskKind::Delete), DEFAULT_MAX_RETRIES);
        assert_eq!(max_retries(TaskKind::PerformPostProvision), WAITING_MAX_RETRIES);
        assert_eq!(max_retries(TaskKind::NotifyCreateServiceWebhook), WAITING_MAX_RETRIES);
    }

    #[test]
    fn test_partial_workflow_is_not_retried() {
        let failure = WorkflowFailure {
            workflow: WorkflowKind::RestoreBackup,
            resource: "cacheabc".to_string(),
            failed_step: WorkflowStep::AwaitDeletion,
            last_completed: Some(WorkflowStep::DeleteCluster),
            cause: ProviderError::Timeout("deletion".to_string()),
        };
        let outcome = TaskOutcome::from_provider_error(&ProviderError::from(failure.clone()));
        assert!(matches!(outcome, TaskOutcome::Failed(_)));

        let untouched = WorkflowFailure {
            last_completed: None,
            failed_step: WorkflowStep::VerifyBackup,
            ..failure
        };
        let outcome = TaskOutcome::from_provider_error(&ProviderError::from(untouched));
        assert!(matches!(outcome, TaskOutcome::Retry(_)));

        let outcome = TaskOutcome::from_provider_error(&ProviderError::Backend("throttled".into()));
        assert!(matches!(outcome, TaskOutcome::Retry(_)));

        let outcome = TaskOutcome::from_provider_error(&ProviderError::NotFound("backup".into()));
        assert!(matches!(outcome, TaskOutcome::Failed(_)));
    }
}
