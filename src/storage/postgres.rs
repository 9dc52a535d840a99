//! # PostgreSQL Storage
//!
//! Runtime-checked sqlx queries against four tables: `services`, `plans`, `resources`
//! and `tasks`. [`PgStorage::bootstrap`] creates them when missing and is safe to run on
//! every start.
//!
//! Tasks are popped with `FOR UPDATE SKIP LOCKED` so several executors can share a queue.

use super::{attached_plan_id, check_instance_id_format, Storage};
use crate::error::{StorageError, StorageResult};
use crate::models::{
    CatalogPlan, Entry, Instance, ProviderKind, ProviderPlan, Service, Task, TaskKind, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS services (
        service varchar(1024) PRIMARY KEY,
        name varchar(200) NOT NULL,
        description text NOT NULL DEFAULT '',
        bindable boolean NOT NULL DEFAULT true,
        plan_updateable boolean NOT NULL DEFAULT true,
        deleted boolean NOT NULL DEFAULT false
    )"#,
    r#"CREATE TABLE IF NOT EXISTS plans (
        plan varchar(1024) PRIMARY KEY,
        service varchar(1024) NOT NULL REFERENCES services(service),
        name varchar(200) NOT NULL,
        description text NOT NULL DEFAULT '',
        free boolean NOT NULL DEFAULT false,
        scheme varchar(64) NOT NULL,
        provider varchar(64) NOT NULL,
        provider_private_details text NOT NULL DEFAULT '{}',
        deleted boolean NOT NULL DEFAULT false
    )"#,
    r#"CREATE TABLE IF NOT EXISTS resources (
        id varchar(1024) PRIMARY KEY,
        name varchar(200) NOT NULL,
        plan varchar(1024) NOT NULL REFERENCES plans(plan),
        claimed boolean NOT NULL DEFAULT false,
        tasks integer NOT NULL DEFAULT 0,
        status varchar(1024) NOT NULL DEFAULT '',
        username varchar(128) NOT NULL DEFAULT '',
        password varchar(128) NOT NULL DEFAULT '',
        endpoint varchar(1024) NOT NULL DEFAULT '',
        created timestamptz NOT NULL DEFAULT now(),
        updated timestamptz NOT NULL DEFAULT now(),
        deleted boolean NOT NULL DEFAULT false
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tasks (
        task varchar(1024) PRIMARY KEY,
        resource varchar(1024) NOT NULL,
        action varchar(64) NOT NULL,
        status varchar(32) NOT NULL DEFAULT 'pending',
        retries integer NOT NULL DEFAULT 0,
        metadata text NOT NULL DEFAULT '',
        result text,
        created timestamptz NOT NULL DEFAULT now(),
        updated timestamptz NOT NULL DEFAULT now()
    )"#,
    "CREATE INDEX IF NOT EXISTS tasks_pending_idx ON tasks (created) WHERE status = 'pending'",
    "CREATE INDEX IF NOT EXISTS tasks_resource_idx ON tasks (resource, action)",
];

const ENTRY_COLUMNS: &str =
    "id, name, plan AS plan_id, claimed, tasks, status, username, password, endpoint";

const TASK_COLUMNS: &str = "task, resource, action, status, retries, metadata, result, created";

/// PostgreSQL-backed storage
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, then create the schema if needed
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let storage = Self::new(pool);
        storage.bootstrap().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent schema creation
    pub async fn bootstrap(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(tables = 4, "💾 Storage schema ready");
        Ok(())
    }

    pub async fn health_check(&self) -> StorageResult<bool> {
        let row = sqlx::query("SELECT 1 AS health")
            .fetch_one(&self.pool)
            .await?;
        let health: i32 = row.try_get("health")?;
        Ok(health == 1)
    }

    async fn has_open_task(&self, instance_id: &str, kind: TaskKind) -> StorageResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM tasks WHERE resource = $1 AND action = $2 \
             AND status IN ('pending', 'started')) AS open",
        )
        .bind(instance_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("open")?)
    }
}

fn plan_from_row(row: &PgRow) -> StorageResult<ProviderPlan> {
    let id: String = row.try_get("plan")?;
    let provider: String = row.try_get("provider")?;
    let provider = provider
        .parse::<ProviderKind>()
        .unwrap_or(ProviderKind::Unknown);
    Ok(ProviderPlan::new(
        id.clone(),
        provider,
        row.try_get::<String, _>("scheme")?,
        row.try_get::<String, _>("provider_private_details")?,
        CatalogPlan {
            id,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            free: row.try_get("free")?,
        },
    ))
}

fn task_from_row(row: &PgRow) -> StorageResult<Task> {
    let kind: String = row.try_get("action")?;
    let status: String = row.try_get("status")?;
    let created_at: DateTime<Utc> = row.try_get("created")?;
    Ok(Task {
        id: row.try_get("task")?,
        kind: kind.parse().map_err(StorageError::Serialization)?,
        instance_id: row.try_get("resource")?,
        metadata: row.try_get("metadata")?,
        status: status.parse().map_err(StorageError::Serialization)?,
        retries: row.try_get("retries")?,
        result: row.try_get("result")?,
        created_at,
    })
}

fn require_affected(rows: u64, what: String) -> StorageResult<()> {
    if rows == 0 {
        Err(StorageError::NotFound(what))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn get_instance(&self, instance_id: &str) -> StorageResult<Entry> {
        sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM resources WHERE id = $1 AND claimed = true AND deleted = false"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("instance {instance_id}")))
    }

    async fn add_instance(&self, instance: &Instance) -> StorageResult<()> {
        let plan_id = attached_plan_id(instance)?;
        sqlx::query(
            "INSERT INTO resources (id, name, plan, claimed, status, username, password, endpoint) \
             VALUES ($1, $2, $3, true, $4, $5, $6, $7)",
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(plan_id)
        .bind(&instance.status)
        .bind(&instance.username)
        .bind(&instance.password)
        .bind(&instance.endpoint)
        .execute(&self.pool)
        .await?;
        debug!(instance_id = %instance.id, name = %instance.name, "Instance recorded");
        Ok(())
    }

    async fn delete_instance(&self, instance: &Instance) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE resources SET deleted = true, updated = now() WHERE id = $1 AND deleted = false",
        )
        .bind(&instance.id)
        .execute(&self.pool)
        .await?;
        require_affected(result.rows_affected(), format!("instance {}", instance.id))
    }

    async fn update_instance(&self, instance: &Instance, plan_id: &str) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE resources SET name = $2, status = $3, endpoint = $4, plan = $5, updated = now() \
             WHERE id = $1 AND deleted = false",
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.status)
        .bind(&instance.endpoint)
        .bind(plan_id)
        .execute(&self.pool)
        .await?;
        require_affected(result.rows_affected(), format!("instance {}", instance.id))
    }

    async fn get_plan_by_id(&self, plan_id: &str) -> StorageResult<ProviderPlan> {
        let row = sqlx::query(
            "SELECT plan, name, description, free, scheme, provider, provider_private_details \
             FROM plans WHERE plan = $1 AND deleted = false",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("plan {plan_id}")))?;
        plan_from_row(&row)
    }

    async fn get_services(&self) -> StorageResult<Vec<Service>> {
        let plan_rows = sqlx::query(
            "SELECT service, plan, name, description, free FROM plans WHERE deleted = false ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut plans: HashMap<String, Vec<CatalogPlan>> = HashMap::new();
        for row in &plan_rows {
            let service: String = row.try_get("service")?;
            plans.entry(service).or_default().push(CatalogPlan {
                id: row.try_get("plan")?,
                name: row.try_get("name")?,
                description: row.try_get("description")?,
                free: row.try_get("free")?,
            });
        }

        let service_rows = sqlx::query(
            "SELECT service, name, description, bindable, plan_updateable FROM services \
             WHERE deleted = false ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        service_rows
            .iter()
            .map(|row| {
                let id: String = row.try_get("service")?;
                Ok(Service {
                    plans: plans.remove(&id).unwrap_or_default(),
                    id,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    bindable: row.try_get("bindable")?,
                    plan_updateable: row.try_get("plan_updateable")?,
                })
            })
            .collect()
    }

    async fn get_unclaimed_instance(&self, plan_id: &str, instance_id: &str) -> StorageResult<Entry> {
        sqlx::query_as::<_, Entry>(&format!(
            "UPDATE resources SET claimed = true, id = $2, updated = now() \
             WHERE id = (SELECT id FROM resources WHERE claimed = false AND deleted = false \
             AND plan = $1 ORDER BY created LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(plan_id)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("unclaimed instance of plan {plan_id}")))
    }

    async fn return_claimed_instance(&self, instance_id: &str) -> StorageResult<()> {
        let result = sqlx::query("UPDATE resources SET claimed = false, updated = now() WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        require_affected(result.rows_affected(), format!("instance {instance_id}"))
    }

    async fn validate_instance_id(&self, instance_id: &str) -> StorageResult<()> {
        check_instance_id_format(instance_id)?;
        let row = sqlx::query("SELECT count(*) AS uses FROM resources WHERE id = $1 AND deleted = true")
            .bind(instance_id)
            .fetch_one(&self.pool)
            .await?;
        let uses: i64 = row.try_get("uses")?;
        if uses > 0 {
            return Err(StorageError::InvalidInstanceId(format!(
                "{instance_id} was already used"
            )));
        }
        Ok(())
    }

    async fn is_upgrading(&self, instance_id: &str) -> StorageResult<bool> {
        self.has_open_task(instance_id, TaskKind::ChangePlans).await
    }

    async fn is_restoring(&self, instance_id: &str) -> StorageResult<bool> {
        self.has_open_task(instance_id, TaskKind::RestoreBackup).await
    }

    async fn add_task(&self, instance_id: &str, kind: TaskKind, metadata: &str) -> StorageResult<String> {
        let task_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO tasks (task, resource, action, metadata) VALUES ($1, $2, $3, $4)")
            .bind(&task_id)
            .bind(instance_id)
            .bind(kind.as_str())
            .bind(metadata)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE resources SET tasks = tasks + 1, updated = now() WHERE id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(instance_id = instance_id, task_id = %task_id, kind = %kind, "Task queued");
        Ok(task_id)
    }

    async fn pop_task(&self) -> StorageResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "UPDATE tasks SET status = 'started', updated = now() \
             WHERE task = (SELECT task FROM tasks WHERE status = 'pending' \
             ORDER BY created LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING {TASK_COLUMNS}"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        retries: i32,
        result: &str,
    ) -> StorageResult<()> {
        let outcome = sqlx::query(
            "UPDATE tasks SET status = $2, retries = $3, result = $4, updated = now() WHERE task = $1",
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(retries)
        .bind(result)
        .execute(&self.pool)
        .await?;
        require_affected(outcome.rows_affected(), format!("task {task_id}"))
    }

    async fn update_plan(&self, instance_id: &str, plan_id: &str) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE resources SET plan = $2, updated = now() WHERE id = $1 AND deleted = false",
        )
        .bind(instance_id)
        .bind(plan_id)
        .execute(&self.pool)
        .await?;
        require_affected(result.rows_affected(), format!("instance {instance_id}"))
    }
}
