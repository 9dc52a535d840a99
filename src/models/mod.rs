//! Data model shared by the broker, providers and storage.

pub mod instance;
pub mod plan;
pub mod task;

pub use instance::{BackupSpec, Entry, Instance, ResourceSpec, Stat};
pub use plan::{CatalogPlan, ProviderKind, ProviderPlan, Service};
pub use task::{
    ChangePlansTaskMetadata, DeleteTaskMetadata, RestoreTaskMetadata, Task, TaskKind, TaskStatus,
    WebhookTaskMetadata,
};
