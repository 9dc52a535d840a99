//! # Broker
//!
//! Implements the provisioning protocol verbs on top of [`Storage`] and the
//! [`ProviderRegistry`].
//!
//! ## Flow
//!
//! 1. Mutating verbs (provision, deprovision, bind, unbind) enter the [`MutationGate`]
//! 2. The instance record is resolved to its plan, the plan to its provider
//! 3. The provider call runs; it may poll a backend for minutes
//! 4. Follow-up work that cannot finish inline is queued as a task
//!
//! ## Error Mapping
//!
//! A missing record, plan or backend resource becomes [`BrokerError::NotFound`]. Every
//! other storage or provider failure is logged with context and becomes
//! [`BrokerError::InternalServerError`]; details never reach the caller.
//!
//! ## Reconciliation
//!
//! Either the persisted record and the backend resource agree, or a task exists to bring
//! them back together. When neither holds, an orphan marker is logged.

use crate::config::BrokerConfig;
use crate::error::{
    BrokerError, BrokerResult, LookupError, SetupError, StorageError, UnprocessableCode,
};
use crate::logging::{log_broker_operation, log_orphan};
use crate::models::{
    BackupSpec, ChangePlansTaskMetadata, DeleteTaskMetadata, Instance, ProviderPlan,
    RestoreTaskMetadata, Stat, TaskKind, WebhookTaskMetadata,
};
use crate::orchestration::actions::{ActionKind, ActionRegistry, HttpMethod};
use crate::orchestration::gate::MutationGate;
use crate::orchestration::types::{
    ActionResponse, BindRequest, BindResponse, CatalogResponse, DeprovisionResponse,
    GetBindingResponse, LastOperationResponse, OperationState, ProvisionRequest,
    ProvisionResponse, UpdateRequest, UpdateResponse,
};
use crate::providers::{BackendClients, Provider, ProviderRegistry};
use crate::status;
use crate::storage::Storage;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub const BINDING_TAG: &str = "Binding";
pub const APP_TAG: &str = "App";

/// Log a failure with context and hide it behind the protocol's internal error
fn internal(operation: &str, instance_id: &str, error: &dyn fmt::Display) -> BrokerError {
    error!(
        operation = operation,
        instance_id = instance_id,
        error = %error,
        "❌ Broker operation failed"
    );
    BrokerError::InternalServerError
}

fn lookup_failure(operation: &str, instance_id: &str, error: LookupError) -> BrokerError {
    if error.is_not_found() {
        debug!(operation = operation, instance_id = instance_id, error = %error, "Instance not found");
        BrokerError::NotFound
    } else {
        internal(operation, instance_id, &error)
    }
}

fn not_yet_available(description: &str) -> BrokerError {
    BrokerError::unprocessable(UnprocessableCode::ServiceNotYetAvailable, description)
}

fn async_required() -> BrokerError {
    BrokerError::unprocessable(
        UnprocessableCode::AsyncRequired,
        "The query parameter accepts_incomplete=true MUST be included the request.",
    )
}

#[derive(Debug)]
pub struct Broker {
    storage: Arc<dyn Storage>,
    providers: ProviderRegistry,
    gate: MutationGate,
    actions: ActionRegistry,
}

impl Broker {
    pub fn new(storage: Arc<dyn Storage>, providers: ProviderRegistry) -> Self {
        Self {
            storage,
            providers,
            gate: MutationGate::new(),
            actions: ActionRegistry::default(),
        }
    }

    /// Validate the configuration and build providers for it
    pub fn from_config(
        config: &BrokerConfig,
        storage: Arc<dyn Storage>,
        clients: BackendClients,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let providers = ProviderRegistry::from_config(config, clients)?;
        info!(
            name_prefix = %config.name_prefix,
            use_kubernetes = config.use_kubernetes,
            test_mode = config.test,
            "✅ Broker initialized"
        );
        Ok(Self::new(storage, providers))
    }

    /// Connect the configured backends, then build the broker over them
    pub async fn connect(config: &BrokerConfig, storage: Arc<dyn Storage>) -> Result<Self, SetupError> {
        config.validate()?;
        let clients = BackendClients::connect(config).await?;
        Self::from_config(config, storage, clients)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Resolve an instance record to its live view, overlaying persisted identity
    pub async fn get_instance_by_id(&self, instance_id: &str) -> Result<Instance, LookupError> {
        let entry = self.storage.get_instance(instance_id).await?;
        let plan = self.storage.get_plan_by_id(&entry.plan_id).await?;
        let provider = self.providers.provider_for(&plan)?;
        let instance = provider.get_instance(&entry.name, &plan).await?;
        Ok(instance.with_entry(&entry, plan))
    }

    fn provider_for(&self, operation: &str, instance: &Instance) -> BrokerResult<Arc<dyn Provider>> {
        let plan = instance
            .plan
            .as_ref()
            .ok_or_else(|| internal(operation, &instance.id, &"instance has no plan attached"))?;
        self.providers
            .provider_for(plan)
            .map_err(|e| internal(operation, &instance.id, &e))
    }

    /// Resolve for a verb, mapping lookup failures onto protocol errors
    async fn resolve(&self, operation: &str, instance_id: &str) -> BrokerResult<(Instance, Arc<dyn Provider>)> {
        let instance = self
            .get_instance_by_id(instance_id)
            .await
            .map_err(|e| lookup_failure(operation, instance_id, e))?;
        let provider = self.provider_for(operation, &instance)?;
        Ok((instance, provider))
    }

    async fn enqueue(&self, instance: &Instance, kind: TaskKind, metadata: &str) -> Result<String, StorageError> {
        let result = self.storage.add_task(&instance.id, kind, metadata).await;
        match &result {
            Ok(task_id) => info!(
                instance_id = %instance.id,
                task_id = %task_id,
                kind = %kind,
                "📬 Follow-up task scheduled"
            ),
            Err(e) => error!(
                instance_id = %instance.id,
                name = %instance.name,
                kind = %kind,
                error = %e,
                "Unable to schedule follow-up task"
            ),
        }
        result
    }

    /// Schedule removal of `instance`'s backend resource, recording its plan
    async fn enqueue_delete(&self, instance: &Instance) -> Result<String, StorageError> {
        let metadata = DeleteTaskMetadata::new(&instance.name, instance.plan_id());
        let metadata = serde_json::to_string(&metadata).unwrap_or_else(|_| instance.name.clone());
        self.enqueue(instance, TaskKind::Delete, &metadata).await
    }

    /// Catalog of services and plans
    #[instrument(skip(self))]
    pub async fn get_catalog(&self) -> BrokerResult<CatalogResponse> {
        let services = self
            .storage
            .get_services()
            .await
            .map_err(|e| internal("get_catalog", "", &e))?;
        Ok(CatalogResponse { services })
    }

    /// Create an instance, or confirm one already provisioned with the same plan
    ///
    /// Never waits for the backend: a resource that is not ready yet is reported as an
    /// asynchronous operation keyed by the instance id.
    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, plan_id = %request.plan_id))]
    pub async fn provision(&self, request: ProvisionRequest) -> BrokerResult<ProvisionResponse> {
        let _pass = self.gate.enter(&request.instance_id).await;

        if !request.accepts_incomplete {
            return Err(async_required());
        }
        if request.instance_id.is_empty() {
            return Err(BrokerError::unprocessable(
                UnprocessableCode::InstanceRequired,
                "The instance ID was not provided.",
            ));
        }
        if let Err(e) = self.storage.validate_instance_id(&request.instance_id).await {
            debug!(instance_id = %request.instance_id, error = %e, "Instance id rejected");
            return Err(BrokerError::unprocessable(
                UnprocessableCode::InstanceInvalid,
                "The instance ID was either already in-use or invalid.",
            ));
        }

        let plan = match self.storage.get_plan_by_id(&request.plan_id).await {
            Ok(plan) => plan,
            Err(e) if e.is_not_found() => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("provision", &request.instance_id, &e)),
        };

        let (instance, exists) = match self.get_instance_by_id(&request.instance_id).await {
            Ok(existing) => {
                if existing.plan_id() != Some(request.plan_id.as_str()) {
                    return Err(BrokerError::Conflict("InstanceID in use".to_string()));
                }
                (existing, true)
            }
            Err(LookupError::Storage(e)) if e.is_not_found() => {
                (self.claim_or_create(&request, &plan).await?, false)
            }
            Err(e) => return Err(internal("provision", &request.instance_id, &e)),
        };

        let is_async = !instance.ready;
        log_broker_operation(
            "provision",
            &request.instance_id,
            Some(&plan.id),
            &instance.status,
            Some(if exists { "exists" } else { "created" }),
        );
        Ok(ProvisionResponse {
            exists,
            is_async,
            operation: is_async.then(|| request.instance_id.clone()),
            extension_apis: self.actions.extension_apis(&request.instance_id),
        })
    }

    /// Hand out a pooled instance of the plan, or provision a fresh one
    async fn claim_or_create(&self, request: &ProvisionRequest, plan: &ProviderPlan) -> BrokerResult<Instance> {
        match self
            .storage
            .get_unclaimed_instance(&plan.id, &request.instance_id)
            .await
        {
            Ok(entry) => {
                return match self.get_instance_by_id(&entry.id).await {
                    Ok(instance) => {
                        info!(instance_id = %entry.id, name = %entry.name, "♻️ Claimed pooled instance");
                        Ok(instance)
                    }
                    Err(e) => {
                        if let Err(returned) = self.storage.return_claimed_instance(&entry.id).await {
                            error!(
                                instance_id = %entry.id,
                                error = %returned,
                                "Unable to return pooled instance"
                            );
                        }
                        Err(internal("provision", &request.instance_id, &e))
                    }
                };
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(internal("provision", &request.instance_id, &e)),
        }
        self.create_instance(request, plan).await
    }

    async fn create_instance(&self, request: &ProvisionRequest, plan: &ProviderPlan) -> BrokerResult<Instance> {
        let provider = self
            .providers
            .provider_for(plan)
            .map_err(|e| internal("provision", &request.instance_id, &e))?;

        let mut instance = provider
            .provision(&request.instance_id, plan, &request.organization_guid)
            .await
            .map_err(|e| internal("provision", &request.instance_id, &e))?;
        instance.id = request.instance_id.clone();
        instance.plan = Some(plan.clone());

        if let Err(e) = self.storage.add_instance(&instance).await {
            error!(
                instance_id = %instance.id,
                name = %instance.name,
                error = %e,
                "Error inserting record for provisioned resource"
            );
            self.compensate(provider.as_ref(), &instance).await;
            return Err(BrokerError::InternalServerError);
        }

        if !status::is_available(&instance.status) {
            if self
                .enqueue(&instance, TaskKind::PerformPostProvision, "")
                .await
                .is_err()
            {
                warn!(
                    instance_id = %instance.id,
                    "Post-provision resync not scheduled, last_operation will resync the record"
                );
            }
            if let Some(webhook) = &request.webhook {
                let metadata = WebhookTaskMetadata {
                    url: webhook.url.clone(),
                    secret: webhook.secret.clone(),
                };
                match serde_json::to_string(&metadata) {
                    Ok(metadata) => {
                        if self
                            .enqueue(&instance, TaskKind::NotifyCreateServiceWebhook, &metadata)
                            .await
                            .is_err()
                        {
                            warn!(instance_id = %instance.id, "Create webhook will not be sent");
                        }
                    }
                    Err(e) => error!(instance_id = %instance.id, error = %e, "Unable to encode webhook metadata"),
                }
            }
        }
        Ok(instance)
    }

    /// Undo a provision whose record could not be written
    async fn compensate(&self, provider: &dyn Provider, instance: &Instance) {
        match provider.deprovision(instance, false).await {
            Ok(()) => warn!(
                instance_id = %instance.id,
                name = %instance.name,
                "Provisioned resource removed after its record could not be written"
            ),
            Err(e) => {
                error!(
                    instance_id = %instance.id,
                    name = %instance.name,
                    error = %e,
                    "Cleanup deprovision failed after record insert failure"
                );
                if let Err(task_error) = self.enqueue_delete(instance).await {
                    log_orphan(&instance.id, &instance.name, &task_error.to_string());
                }
            }
        }
    }

    /// Remove an instance; falls back to a delete task when the backend refuses
    #[instrument(skip(self))]
    pub async fn deprovision(&self, instance_id: &str) -> BrokerResult<DeprovisionResponse> {
        let _pass = self.gate.enter(instance_id).await;
        let (instance, provider) = self.resolve("deprovision", instance_id).await?;

        if let Err(e) = provider.deprovision(&instance, true).await {
            error!(
                instance_id = %instance.id,
                name = %instance.name,
                error = %e,
                "Deprovision failed, scheduling retry"
            );
            self.enqueue_delete(&instance)
                .await
                .map_err(|task_error| internal("deprovision", instance_id, &task_error))?;
            return Ok(DeprovisionResponse { is_async: true });
        }

        self.storage
            .delete_instance(&instance)
            .await
            .map_err(|e| internal("deprovision", instance_id, &e))?;
        log_broker_operation("deprovision", instance_id, instance.plan_id(), "deleted", None);
        Ok(DeprovisionResponse { is_async: false })
    }

    /// Schedule a plan change
    #[instrument(skip(self, request), fields(instance_id = %request.instance_id))]
    pub async fn update(&self, request: UpdateRequest) -> BrokerResult<UpdateResponse> {
        if !request.accepts_incomplete {
            return Err(async_required());
        }
        let instance = self
            .get_instance_by_id(&request.instance_id)
            .await
            .map_err(|e| lookup_failure("update", &request.instance_id, e))?;

        let Some(plan_id) = request.plan_id.as_deref() else {
            return Err(BrokerError::unprocessable(
                UnprocessableCode::UpgradeError,
                "A target plan must be provided.",
            ));
        };
        if !status::is_available(&instance.status) {
            return Err(BrokerError::unprocessable(
                UnprocessableCode::ConcurrencyError,
                "Clients MUST wait until pending requests have completed for the specified resources.",
            ));
        }
        if plan_id.eq_ignore_ascii_case(instance.plan_id().unwrap_or_default()) {
            return Err(BrokerError::unprocessable(
                UnprocessableCode::UpgradeError,
                "Cannot upgrade to the same plan.",
            ));
        }

        let target = match self.storage.get_plan_by_id(plan_id).await {
            Ok(plan) => plan,
            Err(e) if e.is_not_found() => return Err(BrokerError::NotFound),
            Err(e) => return Err(internal("update", &request.instance_id, &e)),
        };

        let current_provider = instance.plan.as_ref().map(|plan| plan.provider);
        if current_provider != Some(target.provider) && instance.engine != "memcached" {
            return Err(BrokerError::unprocessable(
                UnprocessableCode::UpgradeError,
                "Cannot upgrade or change redis plans across provider types.",
            ));
        }

        let metadata = serde_json::to_string(&ChangePlansTaskMetadata {
            plan: target.id.clone(),
        })
        .map_err(|e| internal("update", &request.instance_id, &e))?;
        self.enqueue(&instance, TaskKind::ChangePlans, &metadata)
            .await
            .map_err(|e| internal("update", &request.instance_id, &e))?;

        log_broker_operation("update", &request.instance_id, Some(&target.id), "scheduled", None);
        Ok(UpdateResponse { is_async: true })
    }

    /// Report progress of the last asynchronous operation
    ///
    /// Queued upgrades and restores win over the live status. Otherwise the live status
    /// is written back to storage and classified.
    #[instrument(skip(self))]
    pub async fn last_operation(&self, instance_id: &str) -> BrokerResult<LastOperationResponse> {
        let upgrading = self
            .storage
            .is_upgrading(instance_id)
            .await
            .map_err(|e| internal("last_operation", instance_id, &e))?;
        let restoring = self
            .storage
            .is_restoring(instance_id)
            .await
            .map_err(|e| internal("last_operation", instance_id, &e))?;

        if upgrading || restoring {
            let marker = if upgrading { "upgrading" } else { "restoring" };
            let description = match self.get_instance_by_id(instance_id).await {
                Ok(instance) if !status::is_available(&instance.status) => instance.status,
                _ => marker.to_string(),
            };
            return Ok(LastOperationResponse {
                state: OperationState::InProgress,
                description,
            });
        }

        let instance = self
            .get_instance_by_id(instance_id)
            .await
            .map_err(|e| lookup_failure("last_operation", instance_id, e))?;

        if let Some(plan_id) = instance.plan_id() {
            if let Err(e) = self.storage.update_instance(&instance, plan_id).await {
                warn!(instance_id = instance_id, error = %e, "Unable to resync instance status");
            }
        }

        let state = if instance.ready {
            OperationState::Succeeded
        } else if status::in_progress(&instance.status) {
            OperationState::InProgress
        } else {
            OperationState::Failed
        };
        Ok(LastOperationResponse {
            state,
            description: instance.status,
        })
    }

    /// Hand out credentials, tagging the resource with the binding and app when known
    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, binding_id = %request.binding_id))]
    pub async fn bind(&self, request: BindRequest) -> BrokerResult<BindResponse> {
        let _pass = self.gate.enter(&request.instance_id).await;
        let (instance, provider) = self.resolve("bind", &request.instance_id).await?;
        if !instance.ready {
            return Err(not_yet_available("The service requested is not yet available."));
        }

        if let Some(app_guid) = request.app_guid.as_deref() {
            provider
                .tag(&instance, BINDING_TAG, &request.binding_id)
                .await
                .map_err(|e| internal("bind", &request.instance_id, &e))?;
            provider
                .tag(&instance, APP_TAG, app_guid)
                .await
                .map_err(|e| internal("bind", &request.instance_id, &e))?;
        }

        log_broker_operation("bind", &request.instance_id, instance.plan_id(), "bound", None);
        Ok(BindResponse {
            is_async: false,
            credentials: provider.get_url(&instance),
        })
    }

    /// Remove the binding and app tags
    #[instrument(skip(self))]
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> BrokerResult<()> {
        let _pass = self.gate.enter(instance_id).await;
        let (instance, provider) = self.resolve("unbind", instance_id).await?;
        if !instance.ready {
            return Err(not_yet_available("The service requested is not yet available."));
        }

        for key in [BINDING_TAG, APP_TAG] {
            provider
                .untag(&instance, key)
                .await
                .map_err(|e| internal("unbind", instance_id, &e))?;
        }
        log_broker_operation("unbind", instance_id, instance.plan_id(), "unbound", Some(binding_id));
        Ok(())
    }

    /// Credentials of an existing binding
    #[instrument(skip(self))]
    pub async fn get_binding(&self, instance_id: &str, binding_id: &str) -> BrokerResult<GetBindingResponse> {
        let (instance, provider) = self.resolve("get_binding", instance_id).await?;
        if !status::can_get_bindings(&instance.status) {
            return Err(not_yet_available("The service requested is not yet available."));
        }
        Ok(GetBindingResponse {
            credentials: provider.get_url(&instance),
        })
    }

    #[instrument(skip(self))]
    pub async fn list_backups(&self, instance_id: &str) -> BrokerResult<Vec<BackupSpec>> {
        let (instance, provider) = self.resolve("list_backups", instance_id).await?;
        provider
            .list_backups(&instance)
            .await
            .map_err(|e| internal("list_backups", instance_id, &e))
    }

    #[instrument(skip(self))]
    pub async fn get_backup(&self, instance_id: &str, backup_id: &str) -> BrokerResult<BackupSpec> {
        let (instance, provider) = self.resolve("get_backup", instance_id).await?;
        match provider.get_backup(&instance, backup_id).await {
            Ok(backup) => Ok(backup),
            Err(e) if e.is_not_found() => Err(BrokerError::NotFound),
            Err(e) => Err(internal("get_backup", instance_id, &e)),
        }
    }

    #[instrument(skip(self))]
    pub async fn create_backup(&self, instance_id: &str) -> BrokerResult<BackupSpec> {
        let (instance, provider) = self.resolve("create_backup", instance_id).await?;
        if !status::can_be_modified(&instance.status) {
            return Err(not_yet_available(
                "A backup cannot be created while this service is under maintenance.",
            ));
        }
        let backup = provider
            .create_backup(&instance)
            .await
            .map_err(|e| internal("create_backup", instance_id, &e))?;
        log_broker_operation("create_backup", instance_id, instance.plan_id(), &backup.status, Some(&backup.id));
        Ok(backup)
    }

    /// Verify the backup exists, then schedule the restore
    #[instrument(skip(self))]
    pub async fn restore_backup(&self, instance_id: &str, backup_id: &str) -> BrokerResult<()> {
        let (instance, provider) = self.resolve("restore_backup", instance_id).await?;
        if let Err(e) = provider.get_backup(&instance, backup_id).await {
            warn!(instance_id = instance_id, backup_id = backup_id, error = %e, "Unable to find backup to restore");
            return Err(BrokerError::NotFound);
        }

        let metadata = serde_json::to_string(&RestoreTaskMetadata {
            backup: backup_id.to_string(),
        })
        .map_err(|e| internal("restore_backup", instance_id, &e))?;
        self.enqueue(&instance, TaskKind::RestoreBackup, &metadata)
            .await
            .map_err(|e| internal("restore_backup", instance_id, &e))?;
        log_broker_operation("restore_backup", instance_id, instance.plan_id(), "scheduled", Some(backup_id));
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn flush(&self, instance_id: &str) -> BrokerResult<()> {
        let (instance, provider) = self.resolve("flush", instance_id).await?;
        provider
            .flush(&instance)
            .await
            .map_err(|e| internal("flush", instance_id, &e))
    }

    /// Backend-reported metrics, in report order
    #[instrument(skip(self))]
    pub async fn stats(&self, instance_id: &str) -> BrokerResult<Vec<Stat>> {
        let (instance, provider) = self.resolve("stats", instance_id).await?;
        provider
            .stats(&instance)
            .await
            .map_err(|e| internal("stats", instance_id, &e))
    }

    #[instrument(skip(self))]
    pub async fn restart(&self, instance_id: &str) -> BrokerResult<()> {
        let (instance, provider) = self.resolve("restart", instance_id).await?;
        provider
            .restart(&instance)
            .await
            .map_err(|e| internal("restart", instance_id, &e))?;
        log_broker_operation("restart", instance_id, instance.plan_id(), "restarted", None);
        Ok(())
    }

    /// Run an extension action with its captured path variables
    pub async fn perform_action(
        &self,
        instance_id: &str,
        action: ActionKind,
        vars: &HashMap<String, String>,
    ) -> BrokerResult<ActionResponse> {
        let backup_id = || vars.get("backup").map(String::as_str).ok_or(BrokerError::NotFound);
        Ok(match action {
            ActionKind::ListBackups => ActionResponse::Backups(self.list_backups(instance_id).await?),
            ActionKind::GetBackup => {
                ActionResponse::Backup(self.get_backup(instance_id, backup_id()?).await?)
            }
            ActionKind::CreateBackup => ActionResponse::Backup(self.create_backup(instance_id).await?),
            ActionKind::RestoreBackup => {
                self.restore_backup(instance_id, backup_id()?).await?;
                ActionResponse::Status {
                    status: "OK".to_string(),
                }
            }
            ActionKind::Flush => {
                self.flush(instance_id).await?;
                ActionResponse::Flushed {
                    flush_all: "ok".to_string(),
                }
            }
            ActionKind::Stats => ActionResponse::Stats {
                stats: self.stats(instance_id).await?,
            },
            ActionKind::Restart => {
                self.restart(instance_id).await?;
                ActionResponse::Restarted {
                    restart: "ok".to_string(),
                }
            }
        })
    }

    /// Route a method and action path (relative to the instance's actions root)
    pub async fn handle_action(
        &self,
        instance_id: &str,
        method: HttpMethod,
        path: &str,
    ) -> BrokerResult<ActionResponse> {
        let (action, vars) = self
            .actions
            .route(method, path)
            .ok_or(BrokerError::NotFound)?;
        self.perform_action(instance_id, action, &vars).await
    }
}
