//! # Storage
//!
//! Durable catalog of instances and plans, plus the task queue that reconciles the
//! catalog with backend resources.
//!
//! Two implementations:
//!
//! - [`PgStorage`] - PostgreSQL via sqlx, used in production
//! - [`InMemoryStorage`] - `tokio::sync::RwLock` maps, used in tests and test mode
//!
//! Instance ids are single-use. Deleting an instance only marks its record, so
//! [`Storage::validate_instance_id`] rejects the id from then on. Ids of live instances
//! still validate, which keeps a repeated provision request idempotent.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStorage;
pub use postgres::PgStorage;

use crate::config::{BrokerConfig, ConfigurationError};
use crate::error::{SetupError, StorageError, StorageResult};
use crate::models::{Entry, Instance, ProviderPlan, Service, Task, TaskKind, TaskStatus};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Persistence contract used by the broker and the task executor
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Claimed, non-deleted instance record; [`StorageError::NotFound`] otherwise
    async fn get_instance(&self, instance_id: &str) -> StorageResult<Entry>;

    /// Record a newly provisioned instance under its attached plan
    async fn add_instance(&self, instance: &Instance) -> StorageResult<()>;

    async fn delete_instance(&self, instance: &Instance) -> StorageResult<()>;

    /// Resync name, status and endpoint from a live instance
    async fn update_instance(&self, instance: &Instance, plan_id: &str) -> StorageResult<()>;

    async fn get_plan_by_id(&self, plan_id: &str) -> StorageResult<ProviderPlan>;

    async fn get_services(&self) -> StorageResult<Vec<Service>>;

    /// Claim a pre-provisioned instance of `plan_id`, giving it `instance_id`
    async fn get_unclaimed_instance(&self, plan_id: &str, instance_id: &str) -> StorageResult<Entry>;

    /// Put a claimed instance back into the pool
    async fn return_claimed_instance(&self, instance_id: &str) -> StorageResult<()>;

    /// Reject malformed ids and ids of deleted instances
    async fn validate_instance_id(&self, instance_id: &str) -> StorageResult<()>;

    /// An open change-plans task exists for the instance
    async fn is_upgrading(&self, instance_id: &str) -> StorageResult<bool>;

    /// An open restore-backup task exists for the instance
    async fn is_restoring(&self, instance_id: &str) -> StorageResult<bool>;

    /// Enqueue follow-up work, returning the task id
    async fn add_task(&self, instance_id: &str, kind: TaskKind, metadata: &str) -> StorageResult<String>;

    /// Take the oldest pending task, marking it started
    async fn pop_task(&self) -> StorageResult<Option<Task>>;

    /// Record a task's outcome; `Pending` puts it back in the queue
    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        retries: i32,
        result: &str,
    ) -> StorageResult<()>;

    /// Point an instance record at a new plan
    async fn update_plan(&self, instance_id: &str, plan_id: &str) -> StorageResult<()>;
}

/// Storage selected by configuration
///
/// `DATABASE_URL` wins; test mode without a database falls back to memory.
pub async fn from_config(config: &BrokerConfig) -> Result<Arc<dyn Storage>, SetupError> {
    match (&config.database_url, config.test) {
        (Some(url), _) => Ok(Arc::new(PgStorage::connect(url).await?)),
        (None, true) => {
            info!("💾 Using in-memory storage (test mode)");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        (None, false) => Err(ConfigurationError::Invalid(
            "DATABASE_URL is required outside test mode".to_string(),
        )
        .into()),
    }
}

/// Shape check shared by both implementations
pub(crate) fn check_instance_id_format(instance_id: &str) -> StorageResult<()> {
    Uuid::parse_str(instance_id)
        .map(|_| ())
        .map_err(|_| StorageError::InvalidInstanceId(format!("{instance_id} is not a valid uuid")))
}

/// Plan id of an instance about to be written
pub(crate) fn attached_plan_id(instance: &Instance) -> StorageResult<&str> {
    instance.plan_id().ok_or_else(|| {
        StorageError::Serialization(format!("instance {} has no plan attached", instance.id))
    })
}
