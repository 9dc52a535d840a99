//! Broker verbs end to end against the in-memory backends.

mod common;

use cache_broker::error::{BrokerError, StorageError, UnprocessableCode};
use cache_broker::models::{DeleteTaskMetadata, Entry, TaskKind, TaskStatus};
use cache_broker::orchestration::{
    ActionResponse, BindRequest, HttpMethod, OperationState, ProvisionRequest, UpdateRequest,
    WebhookTarget,
};
use cache_broker::providers::elasticache::{
    CreateCacheClusterInput, ElastiCacheApi, ElastiCacheOperation, InMemoryElastiCache,
};
use cache_broker::providers::kubernetes::InMemoryKubernetes;
use cache_broker::storage::in_memory::StorageOperation;
use cache_broker::ProviderError;
use common::*;

fn code(error: &BrokerError) -> Option<UnprocessableCode> {
    error.code()
}

async fn entry_name(test: &TestBroker, instance_id: &str) -> String {
    test.storage
        .entry(instance_id)
        .await
        .expect("entry should exist")
        .name
}

#[tokio::test]
async fn test_provision_is_idempotent() {
    let test = TestBroker::new().await;
    let instance_id = new_instance_id();

    let first = test
        .broker
        .provision(provision_request(&instance_id, REDIS_SMALL))
        .await
        .unwrap();
    assert!(!first.exists);
    assert!(first.is_async);
    assert_eq!(first.operation.as_deref(), Some(instance_id.as_str()));
    assert_eq!(first.extension_apis.len(), 7);

    let second = test
        .broker
        .provision(provision_request(&instance_id, REDIS_SMALL))
        .await
        .unwrap();
    assert!(second.exists);
    assert!(!second.is_async);
    assert!(second.operation.is_none());
    assert_eq!(test.elasticache.cluster_count(), 1);
}

#[tokio::test]
async fn test_provision_with_other_plan_conflicts() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;

    let err = test
        .broker
        .provision(provision_request(&instance_id, REDIS_LARGE))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::Conflict("InstanceID in use".to_string()));
    assert_eq!(test.elasticache.cluster_count(), 1);
}

#[tokio::test]
async fn test_provision_validation_order() {
    let test = TestBroker::new().await;

    let err = test
        .broker
        .provision(ProvisionRequest {
            accepts_incomplete: false,
            ..provision_request("", "unknown-plan")
        })
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::AsyncRequired));

    let err = test
        .broker
        .provision(provision_request("", REDIS_SMALL))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::InstanceRequired));

    let err = test
        .broker
        .provision(provision_request("not-a-uuid", REDIS_SMALL))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::InstanceInvalid));

    let err = test
        .broker
        .provision(provision_request(&new_instance_id(), "unknown-plan"))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::NotFound);
    assert_eq!(test.elasticache.cluster_count(), 0);
}

#[tokio::test]
async fn test_unready_instance_schedules_post_provision() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;

    let tasks = test.storage.tasks_for(&instance_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, TaskKind::PerformPostProvision);

    assert_eq!(test.drain_tasks(5).await, 1);
    let entry = test.storage.entry(&instance_id).await.unwrap();
    assert_eq!(entry.status, "available");
    assert!(entry.endpoint.ends_with(":6379"));
}

#[tokio::test]
async fn test_deleted_instance_id_is_not_reusable() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;

    let response = test.broker.deprovision(&instance_id).await.unwrap();
    assert!(!response.is_async);
    assert!(test.storage.is_deleted(&instance_id).await);

    let err = test
        .broker
        .provision(provision_request(&instance_id, REDIS_SMALL))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::InstanceInvalid));
    assert_eq!(test.broker.deprovision(&instance_id).await.unwrap_err(), BrokerError::NotFound);
}

#[tokio::test]
async fn test_deprovision_failure_schedules_one_delete_and_keeps_record() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;
    test.elasticache.fail_on(
        ElastiCacheOperation::Delete,
        ProviderError::Backend("Throttling".to_string()),
    );

    let response = test.broker.deprovision(&instance_id).await.unwrap();
    assert!(response.is_async);

    let deletes: Vec<_> = test
        .storage
        .tasks_for(&instance_id)
        .await
        .into_iter()
        .filter(|task| task.kind == TaskKind::Delete)
        .collect();
    assert_eq!(deletes.len(), 1);
    let name = entry_name(&test, &instance_id).await;
    let metadata = DeleteTaskMetadata::parse(&deletes[0].metadata);
    assert_eq!(metadata.name, name);
    assert_eq!(metadata.plan.as_deref(), Some(REDIS_SMALL));
    assert!(!test.storage.is_deleted(&instance_id).await);

    test.elasticache.clear_failure(ElastiCacheOperation::Delete);
    test.drain_tasks(10).await;
    assert!(test.storage.is_deleted(&instance_id).await);
    let task = test.storage.task(&deletes[0].id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Finished);
}

#[tokio::test]
async fn test_failed_record_insert_removes_resource() {
    let test = TestBroker::new().await;
    test.storage.fail_on(
        StorageOperation::AddInstance,
        StorageError::Database("connection reset".to_string()),
    );
    let instance_id = new_instance_id();

    let err = test
        .broker
        .provision(provision_request(&instance_id, REDIS_SMALL))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::InternalServerError);
    assert!(test.storage.tasks_for(&instance_id).await.is_empty());
    let clusters = test.elasticache.cluster_ids();
    assert_eq!(clusters.len(), 1);
    let cluster = test.elasticache.cluster(&clusters[0]).unwrap();
    assert_eq!(cluster.cache_cluster_status, "deleting");
}

#[tokio::test]
async fn test_failed_cleanup_schedules_delete_task() {
    let test = TestBroker::new().await;
    test.storage.fail_on(
        StorageOperation::AddInstance,
        StorageError::Database("connection reset".to_string()),
    );
    test.elasticache.fail_on(
        ElastiCacheOperation::Delete,
        ProviderError::Backend("Throttling".to_string()),
    );
    let instance_id = new_instance_id();

    let err = test
        .broker
        .provision(provision_request(&instance_id, REDIS_SMALL))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::InternalServerError);

    let tasks = test.storage.tasks_for(&instance_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, TaskKind::Delete);
    let metadata = DeleteTaskMetadata::parse(&tasks[0].metadata);
    assert!(metadata.name.starts_with("cache"));
    assert_eq!(metadata.plan.as_deref(), Some(REDIS_SMALL));
}

#[tokio::test]
async fn test_unrecorded_cluster_is_removed_by_delete_task() {
    let test = TestBroker::new().await;
    test.storage.fail_on(
        StorageOperation::AddInstance,
        StorageError::Database("connection reset".to_string()),
    );
    test.elasticache.fail_on(
        ElastiCacheOperation::Delete,
        ProviderError::Backend("Throttling".to_string()),
    );
    let instance_id = new_instance_id();
    test.broker
        .provision(provision_request(&instance_id, REDIS_SMALL))
        .await
        .unwrap_err();
    let name = test.elasticache.cluster_ids().remove(0);

    test.storage.clear_failure(StorageOperation::AddInstance);
    test.elasticache.clear_failure(ElastiCacheOperation::Delete);
    test.drain_tasks(10).await;

    let task = test.storage.tasks_for(&instance_id).await.remove(0);
    assert_eq!(task.status, TaskStatus::Finished);
    assert_eq!(task.result.as_deref(), Some(format!("deleted unrecorded {name}").as_str()));
    if let Some(cluster) = test.elasticache.cluster(&name) {
        assert_eq!(cluster.cache_cluster_status, "deleting");
    }
    assert!(test.storage.entry(&instance_id).await.is_none());
}

#[tokio::test]
async fn test_queued_move_updates_plan_once_storage_recovers() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;
    let name = entry_name(&test, &instance_id).await;
    test.storage.fail_on(
        StorageOperation::UpdatePlan,
        StorageError::Database("connection reset".to_string()),
    );

    test.broker
        .update(UpdateRequest {
            instance_id: instance_id.clone(),
            plan_id: Some(REDIS_LARGE.to_string()),
            accepts_incomplete: true,
        })
        .await
        .unwrap();
    test.drain_tasks(3).await;
    assert_eq!(test.storage.entry(&instance_id).await.unwrap().plan_id, REDIS_SMALL);
    let change = test
        .storage
        .tasks_for(&instance_id)
        .await
        .into_iter()
        .find(|task| task.kind == TaskKind::ChangePlans)
        .unwrap();
    assert_eq!(change.status, TaskStatus::Pending);

    test.storage.clear_failure(StorageOperation::UpdatePlan);
    test.drain_tasks(10).await;
    let entry = test.storage.entry(&instance_id).await.unwrap();
    assert_eq!(entry.plan_id, REDIS_LARGE);
    assert_eq!(entry.name, name);
    let change = test.storage.task(&change.id).await.unwrap();
    assert_eq!(change.status, TaskStatus::Finished);
}

#[tokio::test]
async fn test_provision_succeeds_when_follow_up_tasks_cannot_be_queued() {
    let test = TestBroker::with_backends(
        InMemoryElastiCache::new().without_auto_advance(),
        InMemoryKubernetes::new(),
    )
    .await;
    test.storage.fail_on(
        StorageOperation::AddTask,
        StorageError::Database("connection reset".to_string()),
    );
    let instance_id = new_instance_id();

    let response = test
        .broker
        .provision(ProvisionRequest {
            webhook: WebhookTarget::from_parts(Some("http://127.0.0.1:1/hooks/created"), Some("s3cret")),
            ..provision_request(&instance_id, REDIS_SMALL)
        })
        .await
        .unwrap();
    assert!(response.is_async);
    assert!(test.storage.entry(&instance_id).await.is_some());
    assert!(test.storage.tasks_for(&instance_id).await.is_empty());
}

#[tokio::test]
async fn test_pooled_instance_is_claimed() {
    let test = TestBroker::new().await;
    test.elasticache
        .create_cache_cluster(CreateCacheClusterInput {
            cache_cluster_id: Some("cachepool01".to_string()),
            engine: Some("redis".to_string()),
            ..CreateCacheClusterInput::default()
        })
        .await
        .unwrap();
    test.storage
        .add_unclaimed(Entry {
            name: "cachepool01".to_string(),
            plan_id: REDIS_SMALL.to_string(),
            status: "available".to_string(),
            ..Entry::default()
        })
        .await;

    let instance_id = new_instance_id();
    let response = test
        .broker
        .provision(provision_request(&instance_id, REDIS_SMALL))
        .await
        .unwrap();
    assert!(!response.exists);
    assert!(!response.is_async);

    let entry = test.storage.entry(&instance_id).await.unwrap();
    assert!(entry.claimed);
    assert_eq!(entry.name, "cachepool01");
    assert_eq!(test.elasticache.cluster_count(), 1);
}

#[tokio::test]
async fn test_last_operation_follows_backend() {
    let test = TestBroker::with_backends(
        InMemoryElastiCache::new().without_auto_advance(),
        InMemoryKubernetes::new(),
    )
    .await;
    let instance_id = test.provision(REDIS_SMALL).await;

    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::InProgress);
    assert_eq!(state.description, "creating");

    let name = entry_name(&test, &instance_id).await;
    test.elasticache.settle(&name);
    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::Succeeded);
    assert_eq!(test.storage.entry(&instance_id).await.unwrap().status, "available");

    test.elasticache.set_status(&name, "stopped");
    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::Failed);

    assert_eq!(
        test.broker.last_operation(&new_instance_id()).await.unwrap_err(),
        BrokerError::NotFound
    );
}

#[tokio::test]
async fn test_bind_and_unbind_are_symmetric() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;
    let name = entry_name(&test, &instance_id).await;
    let before = test.elasticache.tags(&name);

    let bound = test
        .broker
        .bind(BindRequest {
            instance_id: instance_id.clone(),
            binding_id: "binding-1".to_string(),
            app_guid: Some("app-1".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(
        bound.credentials.get("REDIS_URL").unwrap(),
        &format!("redis://{name}.fake.cache.amazonaws.com:6379")
    );
    let tags = test.elasticache.tags(&name);
    assert_eq!(tags.get("Binding").map(String::as_str), Some("binding-1"));
    assert_eq!(tags.get("App").map(String::as_str), Some("app-1"));
    assert_eq!(tags.get("BillingCode").map(String::as_str), Some("org-1"));

    let binding = test.broker.get_binding(&instance_id, "binding-1").await.unwrap();
    assert_eq!(binding.credentials, bound.credentials);

    test.broker.unbind(&instance_id, "binding-1").await.unwrap();
    assert_eq!(test.elasticache.tags(&name), before);
}

#[tokio::test]
async fn test_bind_requires_ready_instance() {
    let test = TestBroker::with_backends(
        InMemoryElastiCache::new().without_auto_advance(),
        InMemoryKubernetes::new(),
    )
    .await;
    let instance_id = test.provision(REDIS_SMALL).await;

    let err = test
        .broker
        .bind(BindRequest {
            instance_id: instance_id.clone(),
            binding_id: "binding-1".to_string(),
            app_guid: None,
        })
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::ServiceNotYetAvailable));

    let err = test.broker.get_binding(&instance_id, "binding-1").await.unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::ServiceNotYetAvailable));

    let err = test.broker.unbind(&instance_id, "binding-1").await.unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::ServiceNotYetAvailable));
}

#[tokio::test]
async fn test_update_validation() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;
    let request = |plan_id: Option<&str>| UpdateRequest {
        instance_id: instance_id.clone(),
        plan_id: plan_id.map(str::to_string),
        accepts_incomplete: true,
    };

    let err = test
        .broker
        .update(UpdateRequest {
            accepts_incomplete: false,
            ..request(Some(REDIS_LARGE))
        })
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::AsyncRequired));

    let err = test.broker.update(request(None)).await.unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::UpgradeError));

    let err = test.broker.update(request(Some("REDIS-SMALL"))).await.unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::UpgradeError));

    let err = test.broker.update(request(Some("unknown-plan"))).await.unwrap_err();
    assert_eq!(err, BrokerError::NotFound);

    let err = test.broker.update(request(Some(K8S_REDIS))).await.unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::UpgradeError));

    assert!(!test
        .storage
        .tasks_for(&instance_id)
        .await
        .iter()
        .any(|task| task.kind == TaskKind::ChangePlans));
}

#[tokio::test]
async fn test_update_waits_for_available_instance() {
    let test = TestBroker::with_backends(
        InMemoryElastiCache::new().without_auto_advance(),
        InMemoryKubernetes::new(),
    )
    .await;
    let instance_id = test.provision(REDIS_SMALL).await;

    let err = test
        .broker
        .update(UpdateRequest {
            instance_id,
            plan_id: Some(REDIS_LARGE.to_string()),
            accepts_incomplete: true,
        })
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::ConcurrencyError));
}

#[tokio::test]
async fn test_plan_change_in_place() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;
    let name = entry_name(&test, &instance_id).await;

    let response = test
        .broker
        .update(UpdateRequest {
            instance_id: instance_id.clone(),
            plan_id: Some(REDIS_LARGE.to_string()),
            accepts_incomplete: true,
        })
        .await
        .unwrap();
    assert!(response.is_async);

    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::InProgress);
    assert_eq!(state.description, "upgrading");

    test.drain_tasks(10).await;
    let entry = test.storage.entry(&instance_id).await.unwrap();
    assert_eq!(entry.plan_id, REDIS_LARGE);
    assert_eq!(entry.name, name);
    assert_eq!(
        test.elasticache.cluster(&name).unwrap().cache_node_type.as_deref(),
        Some("cache.m5.large")
    );
    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::Succeeded);
}

#[tokio::test]
async fn test_memcached_moves_across_providers() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(MEMCACHED_SMALL).await;
    let old_name = entry_name(&test, &instance_id).await;

    test.broker
        .update(UpdateRequest {
            instance_id: instance_id.clone(),
            plan_id: Some(K8S_MEMCACHED.to_string()),
            accepts_incomplete: true,
        })
        .await
        .unwrap();
    test.drain_tasks(10).await;

    let entry = test.storage.entry(&instance_id).await.unwrap();
    assert_eq!(entry.plan_id, K8S_MEMCACHED);
    assert_ne!(entry.name, old_name);
    assert!(test
        .kubernetes
        .deployment("memcached-system", &entry.name)
        .is_some());
    let old_status = test
        .elasticache
        .cluster(&old_name)
        .map(|cluster| cluster.cache_cluster_status);
    assert!(old_status.is_none() || old_status.as_deref() == Some("deleting"));

    // The in-memory rollout completes on the first read after creation.
    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::InProgress);
    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::Succeeded);
}

#[tokio::test]
async fn test_restore_only_schedules_existing_backups() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;

    let err = test
        .broker
        .restore_backup(&instance_id, "missing-backup")
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::NotFound);
    assert!(!test
        .storage
        .tasks_for(&instance_id)
        .await
        .iter()
        .any(|task| task.kind == TaskKind::RestoreBackup));

    let backup = test.broker.create_backup(&instance_id).await.unwrap();
    test.broker.restore_backup(&instance_id, &backup.id).await.unwrap();
    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::InProgress);
    assert_eq!(state.description, "restoring");

    test.drain_tasks(10).await;
    let name = entry_name(&test, &instance_id).await;
    let cluster = test.elasticache.cluster(&name).unwrap();
    assert_eq!(cluster.cache_cluster_status, "available");
    let state = test.broker.last_operation(&instance_id).await.unwrap();
    assert_eq!(state.state, OperationState::Succeeded);
}

#[tokio::test]
async fn test_backup_actions_route_through_registry() {
    let test = TestBroker::new().await;
    let instance_id = test.provision(REDIS_SMALL).await;

    let created = test
        .broker
        .handle_action(&instance_id, HttpMethod::Post, "backups")
        .await
        .unwrap();
    let ActionResponse::Backup(backup) = created else {
        panic!("expected a backup, got {created:?}");
    };

    let listed = test
        .broker
        .handle_action(&instance_id, HttpMethod::Get, "backups")
        .await
        .unwrap();
    assert!(matches!(listed, ActionResponse::Backups(ref backups) if backups.len() == 1));

    let fetched = test
        .broker
        .handle_action(&instance_id, HttpMethod::Get, &format!("backups/{}", backup.id))
        .await
        .unwrap();
    assert!(matches!(fetched, ActionResponse::Backup(ref found) if found.id == backup.id));

    let restored = test
        .broker
        .handle_action(&instance_id, HttpMethod::Put, &format!("backups/{}", backup.id))
        .await
        .unwrap();
    assert_eq!(
        restored,
        ActionResponse::Status {
            status: "OK".to_string()
        }
    );

    assert_eq!(
        test.broker
            .handle_action(&instance_id, HttpMethod::Get, "backups/missing")
            .await
            .unwrap_err(),
        BrokerError::NotFound
    );
    assert_eq!(
        test.broker
            .handle_action(&instance_id, HttpMethod::Get, "unknown")
            .await
            .unwrap_err(),
        BrokerError::NotFound
    );
    assert_eq!(
        test.broker
            .handle_action(&instance_id, HttpMethod::Post, "flush")
            .await
            .unwrap_err(),
        BrokerError::InternalServerError
    );
}

#[tokio::test]
async fn test_create_backup_refused_during_maintenance() {
    let test = TestBroker::with_backends(
        InMemoryElastiCache::new().without_auto_advance(),
        InMemoryKubernetes::new(),
    )
    .await;
    let instance_id = test.provision(REDIS_SMALL).await;
    let name = entry_name(&test, &instance_id).await;
    test.elasticache.settle(&name);
    test.elasticache.set_status(&name, "backing-up");

    let err = test.broker.create_backup(&instance_id).await.unwrap_err();
    assert_eq!(code(&err), Some(UnprocessableCode::ServiceNotYetAvailable));
}

#[tokio::test]
async fn test_catalog_lists_every_plan() {
    let test = TestBroker::new().await;
    let catalog = test.broker.get_catalog().await.unwrap();
    assert_eq!(catalog.services.len(), 1);
    assert_eq!(catalog.services[0].plans.len(), plans().len());
}
