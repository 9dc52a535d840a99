#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, ElastiCache in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Cache Broker
//!
//! Service broker that hands out Redis and Memcached instances on demand.
//!
//! ## Overview
//!
//! Platform layers speak a standard provisioning protocol (create, bind, update, delete a
//! backing service instance). The broker fulfils each verb by driving one of several
//! infrastructure backends through a uniform [`providers::Provider`] contract, so callers
//! never learn which backend serves an instance.
//!
//! ## Architecture
//!
//! ```text
//! request → Broker (MutationGate) → Storage: entry → plan
//!                                 → ProviderRegistry → Provider → backend API
//!                                 → Storage: record / follow-up task
//! ```
//!
//! Backend calls can take minutes. The broker answers asynchronously whenever a resource
//! is not ready yet, and queues the follow-up work as tasks that [`tasks::TaskExecutor`]
//! runs later.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - broker verbs, mutation gate, extension actions
//! - [`providers`] - managed cluster and container backends
//! - [`status`] - backend status vocabulary and predicates
//! - [`storage`] - instance catalog and task queue (PostgreSQL or in-memory)
//! - [`tasks`] - execution of queued follow-up work
//! - [`models`] - instances, plans, backups, tasks
//! - [`config`] - environment-driven configuration
//! - [`error`] - protocol, provider and storage errors
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cache_broker::config::BrokerConfig;
//! use cache_broker::orchestration::{Broker, ProvisionRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! cache_broker::logging::init_structured_logging();
//!
//! let config = BrokerConfig::from_env()?;
//! let storage = cache_broker::storage::from_config(&config).await?;
//! let broker = Broker::connect(&config, storage).await?;
//!
//! let response = broker
//!     .provision(ProvisionRequest {
//!         instance_id: "5a3c2f9e-7a65-4a43-9f0e-3d2b1f0c8e11".to_string(),
//!         plan_id: "redis-small".to_string(),
//!         accepts_incomplete: true,
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("async: {}", response.is_async);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod providers;
pub mod status;
pub mod storage;
pub mod tasks;

pub use config::{BrokerConfig, ConfigurationError};
pub use error::{
    BrokerError, BrokerResult, LookupError, ProviderError, ProviderResult, SetupError,
    StorageError, StorageResult, UnprocessableCode,
};
pub use models::{
    BackupSpec, Entry, Instance, ProviderKind, ProviderPlan, Service, Stat, Task, TaskKind,
    TaskStatus,
};
pub use orchestration::Broker;
pub use providers::{BackendClients, Credentials, Provider, ProviderRegistry};
pub use storage::{InMemoryStorage, PgStorage, Storage};
pub use tasks::{TaskExecutor, TaskOutcome};
