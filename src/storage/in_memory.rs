//! # In-Memory Storage
//!
//! Thread-safe storage for tests and test mode.
//!
//! ## Features
//!
//! - **Single-use ids**: deleted records stay behind, marked deleted, and their ids are
//!   rejected by `validate_instance_id`
//! - **Instance pool**: seed unclaimed instances with [`InMemoryStorage::add_unclaimed`]
//! - **Failure injection**: [`InMemoryStorage::fail_on`] makes one operation return an error

use super::{attached_plan_id, check_instance_id_format, Storage};
use crate::error::{StorageError, StorageResult};
use crate::models::{Entry, Instance, ProviderPlan, Service, Task, TaskKind, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Operations of [`InMemoryStorage`] that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOperation {
    GetInstance,
    AddInstance,
    DeleteInstance,
    UpdateInstance,
    UpdatePlan,
    GetPlan,
    AddTask,
    PopTask,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: Entry,
    deleted: bool,
}

#[derive(Debug, Default)]
struct StorageState {
    /// Keyed by instance id; unclaimed entries use a placeholder id until claimed
    resources: HashMap<String, StoredEntry>,
    plans: HashMap<String, ProviderPlan>,
    services: Vec<Service>,
    /// Insertion order is queue order
    tasks: Vec<Task>,
}

/// In-memory storage
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: RwLock<StorageState>,
    failures: parking_lot::RwLock<HashMap<StorageOperation, StorageError>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_plan(&self, plan: ProviderPlan) {
        self.state.write().await.plans.insert(plan.id.clone(), plan);
    }

    pub async fn add_service(&self, service: Service) {
        self.state.write().await.services.push(service);
    }

    /// Seed a pre-provisioned instance into the pool
    pub async fn add_unclaimed(&self, mut entry: Entry) {
        entry.claimed = false;
        if entry.id.is_empty() {
            entry.id = format!("pool-{}", Uuid::new_v4());
        }
        self.state.write().await.resources.insert(
            entry.id.clone(),
            StoredEntry {
                entry,
                deleted: false,
            },
        );
    }

    pub fn fail_on(&self, operation: StorageOperation, error: StorageError) {
        self.failures.write().insert(operation, error);
    }

    pub fn clear_failure(&self, operation: StorageOperation) {
        self.failures.write().remove(&operation);
    }

    /// Raw record, including deleted and unclaimed ones (for testing)
    pub async fn entry(&self, instance_id: &str) -> Option<Entry> {
        self.state
            .read()
            .await
            .resources
            .get(instance_id)
            .map(|stored| stored.entry.clone())
    }

    pub async fn is_deleted(&self, instance_id: &str) -> bool {
        self.state
            .read()
            .await
            .resources
            .get(instance_id)
            .is_some_and(|stored| stored.deleted)
    }

    /// Every task ever queued for an instance, oldest first (for testing)
    pub async fn tasks_for(&self, instance_id: &str) -> Vec<Task> {
        self.state
            .read()
            .await
            .tasks
            .iter()
            .filter(|task| task.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.state
            .read()
            .await
            .tasks
            .iter()
            .find(|task| task.id == task_id)
            .cloned()
    }

    fn check_failure(&self, operation: StorageOperation) -> StorageResult<()> {
        match self.failures.read().get(&operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn has_open_task(&self, instance_id: &str, kind: TaskKind) -> bool {
        self.state.read().await.tasks.iter().any(|task| {
            task.instance_id == instance_id && task.kind == kind && task.status.is_open()
        })
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_instance(&self, instance_id: &str) -> StorageResult<Entry> {
        self.check_failure(StorageOperation::GetInstance)?;
        self.state
            .read()
            .await
            .resources
            .get(instance_id)
            .filter(|stored| !stored.deleted && stored.entry.claimed)
            .map(|stored| stored.entry.clone())
            .ok_or_else(|| StorageError::NotFound(format!("instance {instance_id}")))
    }

    async fn add_instance(&self, instance: &Instance) -> StorageResult<()> {
        self.check_failure(StorageOperation::AddInstance)?;
        let plan_id = attached_plan_id(instance)?;
        let mut state = self.state.write().await;
        if state.resources.contains_key(&instance.id) {
            return Err(StorageError::InvalidInstanceId(format!(
                "{} already recorded",
                instance.id
            )));
        }
        state.resources.insert(
            instance.id.clone(),
            StoredEntry {
                entry: Entry::from_instance(instance, plan_id),
                deleted: false,
            },
        );
        debug!(instance_id = %instance.id, name = %instance.name, "Instance recorded");
        Ok(())
    }

    async fn delete_instance(&self, instance: &Instance) -> StorageResult<()> {
        self.check_failure(StorageOperation::DeleteInstance)?;
        let mut state = self.state.write().await;
        let stored = state
            .resources
            .get_mut(&instance.id)
            .filter(|stored| !stored.deleted)
            .ok_or_else(|| StorageError::NotFound(format!("instance {}", instance.id)))?;
        stored.deleted = true;
        Ok(())
    }

    async fn update_instance(&self, instance: &Instance, plan_id: &str) -> StorageResult<()> {
        self.check_failure(StorageOperation::UpdateInstance)?;
        let mut state = self.state.write().await;
        let stored = state
            .resources
            .get_mut(&instance.id)
            .filter(|stored| !stored.deleted)
            .ok_or_else(|| StorageError::NotFound(format!("instance {}", instance.id)))?;
        stored.entry.name = instance.name.clone();
        stored.entry.status = instance.status.clone();
        stored.entry.endpoint = instance.endpoint.clone();
        stored.entry.plan_id = plan_id.to_string();
        Ok(())
    }

    async fn get_plan_by_id(&self, plan_id: &str) -> StorageResult<ProviderPlan> {
        self.check_failure(StorageOperation::GetPlan)?;
        self.state
            .read()
            .await
            .plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("plan {plan_id}")))
    }

    async fn get_services(&self) -> StorageResult<Vec<Service>> {
        Ok(self.state.read().await.services.clone())
    }

    async fn get_unclaimed_instance(&self, plan_id: &str, instance_id: &str) -> StorageResult<Entry> {
        let mut state = self.state.write().await;
        let pooled_id = state
            .resources
            .iter()
            .find(|(_, stored)| {
                !stored.deleted && !stored.entry.claimed && stored.entry.plan_id == plan_id
            })
            .map(|(id, _)| id.clone())
            .ok_or_else(|| StorageError::NotFound(format!("unclaimed instance of plan {plan_id}")))?;

        let mut stored = state
            .resources
            .remove(&pooled_id)
            .ok_or_else(|| StorageError::NotFound(format!("instance {pooled_id}")))?;
        stored.entry.id = instance_id.to_string();
        stored.entry.claimed = true;
        let entry = stored.entry.clone();
        state.resources.insert(instance_id.to_string(), stored);
        debug!(instance_id = instance_id, plan_id = plan_id, name = %entry.name, "Pooled instance claimed");
        Ok(entry)
    }

    async fn return_claimed_instance(&self, instance_id: &str) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let stored = state
            .resources
            .get_mut(instance_id)
            .ok_or_else(|| StorageError::NotFound(format!("instance {instance_id}")))?;
        stored.entry.claimed = false;
        Ok(())
    }

    async fn validate_instance_id(&self, instance_id: &str) -> StorageResult<()> {
        check_instance_id_format(instance_id)?;
        let state = self.state.read().await;
        if state
            .resources
            .get(instance_id)
            .is_some_and(|stored| stored.deleted)
        {
            return Err(StorageError::InvalidInstanceId(format!(
                "{instance_id} was already used"
            )));
        }
        Ok(())
    }

    async fn is_upgrading(&self, instance_id: &str) -> StorageResult<bool> {
        Ok(self.has_open_task(instance_id, TaskKind::ChangePlans).await)
    }

    async fn is_restoring(&self, instance_id: &str) -> StorageResult<bool> {
        Ok(self.has_open_task(instance_id, TaskKind::RestoreBackup).await)
    }

    async fn add_task(&self, instance_id: &str, kind: TaskKind, metadata: &str) -> StorageResult<String> {
        self.check_failure(StorageOperation::AddTask)?;
        let mut state = self.state.write().await;
        let task = Task {
            id: Uuid::new_v4().to_string(),
            kind,
            instance_id: instance_id.to_string(),
            metadata: metadata.to_string(),
            status: TaskStatus::Pending,
            retries: 0,
            result: None,
            created_at: Utc::now(),
        };
        if let Some(stored) = state.resources.get_mut(instance_id) {
            stored.entry.tasks += 1;
        }
        let id = task.id.clone();
        state.tasks.push(task);
        debug!(instance_id = instance_id, task_id = %id, kind = %kind, "Task queued");
        Ok(id)
    }

    async fn pop_task(&self) -> StorageResult<Option<Task>> {
        self.check_failure(StorageOperation::PopTask)?;
        let mut state = self.state.write().await;
        Ok(state
            .tasks
            .iter_mut()
            .find(|task| task.status == TaskStatus::Pending)
            .map(|task| {
                task.status = TaskStatus::Started;
                task.clone()
            }))
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        retries: i32,
        result: &str,
    ) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .iter_mut()
            .find(|task| task.id == task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        task.status = status;
        task.retries = retries;
        task.result = Some(result.to_string());
        Ok(())
    }

    async fn update_plan(&self, instance_id: &str, plan_id: &str) -> StorageResult<()> {
        self.check_failure(StorageOperation::UpdatePlan)?;
        let mut state = self.state.write().await;
        let stored = state
            .resources
            .get_mut(instance_id)
            .filter(|stored| !stored.deleted)
            .ok_or_else(|| StorageError::NotFound(format!("instance {instance_id}")))?;
        stored.entry.plan_id = plan_id.to_string();
        Ok(())
    }
}
