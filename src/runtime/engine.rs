use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result, anyhow, bail};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::ServiceHandler;
use crate::config::EngineConfig;
use crate::definition::{DefinitionRepository, DefinitionResolver, ProcessDefinition};
use crate::error::PvmError;
use crate::migration::{self, MigrationOptions, MigrationPlan};
use crate::nodes::call::CALLED_INSTANCE_COMPLETED;
use crate::runtime::activity_instance::ActivityInstance;
use crate::runtime::execution::ExecutionId;
use crate::runtime::history::{HistoryEvent, HistoryEventHandler};
use crate::runtime::instance::{ProcessInstance, SuperExecution};
use crate::runtime::interpreter::{Effect, Interpreter};
use crate::runtime::listener::ExecutionListener;
use crate::runtime::node::ActivityBehavior;
use crate::runtime::operation::AtomicOperation;
use crate::runtime::records::{EventSubscriptionKind, Incident, Job, RecordId, Task};
use crate::runtime::services::RuntimeServices;
use crate::runtime::storage::{InMemoryProcessStore, ProcessStore};

/// Work a committed command hands to other process instances.
#[derive(Debug)]
enum FollowUp {
    StartCalledInstance {
        super_execution: SuperExecution,
        definition_id: String,
        variables: BTreeMap<String, Value>,
    },
    CompleteCallActivity {
        super_execution: SuperExecution,
        variables: BTreeMap<String, Value>,
    },
    DeleteCalledInstance(Uuid),
}

/// 流程引擎: async command surface over a [`ProcessStore`].
///
/// Commands on one process instance are serialized. Each command runs against
/// a copy of the stored instance, which is saved back only if the command
/// succeeded.
pub struct Engine {
    definitions: DefinitionRepository,
    store: Arc<dyn ProcessStore>,
    services: RuntimeServices,
    history: Option<Arc<dyn HistoryEventHandler>>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryProcessStore::new()))
    }

    pub fn with_store(config: EngineConfig, store: Arc<dyn ProcessStore>) -> Self {
        Self {
            definitions: DefinitionRepository::new(),
            store,
            services: RuntimeServices::with_standard_components(config),
            history: None,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn register_listener(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.services.register_listener(listener);
    }

    pub fn register_handler(&mut self, handler: Arc<dyn ServiceHandler>) {
        self.services.register_handler(handler);
    }

    pub fn register_behavior(&mut self, behavior: Arc<dyn ActivityBehavior>) {
        self.services.register_behavior(behavior);
    }

    pub fn set_history_handler(&mut self, handler: Arc<dyn HistoryEventHandler>) {
        self.history = Some(handler);
    }

    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>> {
        let id = definition.id.clone();
        let deployed = self
            .definitions
            .deploy(definition)
            .with_context(|| format!("Failed to deploy process definition '{}'", id))?;
        info!(definition = %deployed.id, key = %deployed.key, version = deployed.version, "process definition deployed");
        Ok(deployed)
    }

    pub fn definition(&self, definition_id: &str) -> Result<Arc<ProcessDefinition>> {
        Ok(self.definitions.resolve(definition_id)?)
    }

    // commands ////////////////////////////////////////////////////////////

    pub async fn start_process_instance(&self, definition_id: &str, variables: BTreeMap<String, Value>) -> Result<Uuid> {
        let (id, follow_ups) = self.create_instance(definition_id, None, variables, None).await?;
        self.run_follow_ups(follow_ups).await?;
        Ok(id)
    }

    pub async fn start_process_instance_by_key(
        &self,
        key: &str,
        business_key: Option<String>,
        variables: BTreeMap<String, Value>,
    ) -> Result<Uuid> {
        let definition = self
            .definitions
            .latest_by_key(key)
            .ok_or_else(|| anyhow!("No process definition deployed for key '{}'", key))?;
        let (id, follow_ups) = self
            .create_instance(&definition.id, business_key, variables, None)
            .await?;
        self.run_follow_ups(follow_ups).await?;
        Ok(id)
    }

    pub async fn signal(&self, instance_id: Uuid, execution: ExecutionId, signal: &str, payload: Value) -> Result<()> {
        self.execute_command(instance_id, true, |pvm| pvm.signal(execution, signal, &payload))
            .await
    }

    /// Completes a user task, setting `variables` on its execution first.
    pub async fn complete_task(&self, instance_id: Uuid, task: RecordId, variables: BTreeMap<String, Value>) -> Result<()> {
        self.execute_command(instance_id, true, |pvm| {
            let execution = pvm
                .tree
                .tasks
                .get(&task)
                .and_then(|t| t.execution)
                .ok_or_else(|| PvmError::IllegalState(format!("task {} not found", task)))?;
            for (name, value) in &variables {
                pvm.tree.set_variable(execution, name, value.clone());
            }
            pvm.signal(execution, "complete", &Value::Null)
        })
        .await
    }

    pub async fn complete_external_task(
        &self,
        instance_id: Uuid,
        external_task: RecordId,
        variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.execute_command(instance_id, true, |pvm| {
            let execution = pvm
                .tree
                .external_tasks
                .get(&external_task)
                .and_then(|t| t.execution)
                .ok_or_else(|| PvmError::IllegalState(format!("external task {} not found", external_task)))?;
            for (name, value) in &variables {
                pvm.tree.set_variable(execution, name, value.clone());
            }
            pvm.signal(execution, "complete", &Value::Null)
        })
        .await
    }

    /// Delivers a message to the first subscription waiting for it. Returns
    /// `false` if the instance has no such subscription.
    pub async fn correlate_message(&self, instance_id: Uuid, message: &str, payload: Value) -> Result<bool> {
        self.execute_command(instance_id, true, |pvm| {
            let subscription = pvm
                .tree
                .event_subscriptions
                .values()
                .find(|s| s.kind == EventSubscriptionKind::Message && s.event_name.as_deref() == Some(message))
                .map(|s| s.id);
            match subscription {
                Some(id) => {
                    pvm.trigger_subscription(id, &payload)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await
    }

    /// Runs an async continuation or timer job. A failing job loses a retry;
    /// at zero retries a `failedJob` incident is raised.
    pub async fn execute_job(&self, instance_id: Uuid, job: RecordId) -> Result<()> {
        let result = self
            .execute_command(instance_id, true, |pvm| {
                let retries = pvm
                    .tree
                    .jobs
                    .get(&job)
                    .map(|j| j.retries)
                    .ok_or_else(|| PvmError::IllegalState(format!("job {} not found", job)))?;
                if retries == 0 {
                    return Err(PvmError::IllegalState(format!("job {} has no retries left", job)));
                }
                pvm.execute_job(job)
            })
            .await;
        if let Err(err) = &result {
            if !matches!(err.downcast_ref::<PvmError>(), Some(PvmError::InstanceEnded(_))) {
                self.record_job_failure(instance_id, job, err).await?;
            }
        }
        result
    }

    pub async fn perform_operation(
        &self,
        instance_id: Uuid,
        execution: ExecutionId,
        operation: AtomicOperation,
    ) -> Result<()> {
        self.execute_command(instance_id, true, |pvm| pvm.perform_operation(execution, operation))
            .await
    }

    pub async fn delete_process_instance(
        &self,
        instance_id: Uuid,
        reason: &str,
        skip_custom_listeners: bool,
        skip_io_mappings: bool,
    ) -> Result<()> {
        self.execute_command(instance_id, false, |pvm| {
            pvm.delete_process_instance(reason, skip_custom_listeners, skip_io_mappings)
        })
        .await
    }

    /// Moves a running instance onto another definition. Failures are
    /// [`MigrationError`](crate::error::MigrationError)s and leave the stored
    /// instance unchanged.
    pub async fn migrate(&self, instance_id: Uuid, plan: &MigrationPlan, options: MigrationOptions) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let guard = lock.lock().await;

        let mut instance = self.load(instance_id).await?;
        let source = self.definition(&plan.source_definition_id)?;
        let target = self.definition(&plan.target_definition_id)?;
        let history = migration::migrate(&mut instance, plan, options, &source, &target, &self.services)?;
        let follow_ups = Self::collect_follow_ups(&mut instance, Vec::new(), false);
        let ended = instance.ended;
        self.store.save(instance).await?;
        drop(guard);
        if ended {
            self.release_lock(instance_id, lock);
        }

        info!(process_instance = %instance_id, target = %target.id, "process instance migrated");
        self.dispatch_history(history).await;
        self.run_follow_ups(follow_ups).await
    }

    // queries /////////////////////////////////////////////////////////////

    pub async fn process_instance(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>> {
        self.store.load(instance_id).await
    }

    pub async fn activity_instance_tree(&self, instance_id: Uuid) -> Result<ActivityInstance> {
        let instance = self.load(instance_id).await?;
        Ok(instance.tree.activity_instance_tree(&instance.definition_id))
    }

    /// Variables of the process instance scope.
    pub async fn variables(&self, instance_id: Uuid) -> Result<BTreeMap<String, Value>> {
        let instance = self.load(instance_id).await?;
        Ok(instance.tree.variables_local(instance.tree.root()))
    }

    pub async fn tasks(&self, instance_id: Uuid) -> Result<Vec<Task>> {
        let instance = self.load(instance_id).await?;
        Ok(instance.tree.tasks.values().cloned().collect())
    }

    pub async fn jobs(&self, instance_id: Uuid) -> Result<Vec<Job>> {
        let instance = self.load(instance_id).await?;
        Ok(instance.tree.jobs.values().cloned().collect())
    }

    pub async fn incidents(&self, instance_id: Uuid) -> Result<Vec<Incident>> {
        let instance = self.load(instance_id).await?;
        Ok(instance.tree.incidents.values().cloned().collect())
    }

    // internals ///////////////////////////////////////////////////////////

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry of an ended instance unless another command holds
    /// or waits for it.
    fn release_lock(&self, instance_id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        if self
            .locks
            .remove_if(&instance_id, |_, l| Arc::strong_count(l) == 1)
            .is_some()
        {
            debug!(process_instance = %instance_id, "instance lock released");
        }
    }

    /// Number of process instances that currently have a lock entry.
    pub fn locked_instance_count(&self) -> usize {
        self.locks.len()
    }

    async fn load(&self, instance_id: Uuid) -> Result<ProcessInstance> {
        self.store
            .load(instance_id)
            .await?
            .ok_or_else(|| anyhow!("Process instance not found: {}", instance_id))
    }

    async fn create_instance(
        &self,
        definition_id: &str,
        business_key: Option<String>,
        variables: BTreeMap<String, Value>,
        super_execution: Option<SuperExecution>,
    ) -> Result<(Uuid, Vec<FollowUp>)> {
        let definition = self.definition(definition_id)?;
        let mut instance = ProcessInstance::new(&definition.id, business_key);
        instance.super_execution = super_execution;
        let id = instance.id;

        let lock = self.lock_for(id);
        let guard = lock.lock().await;
        let (effects, history) = {
            let mut pvm = Interpreter::new(&mut instance.tree, &definition, &self.services);
            pvm.start(variables)
                .with_context(|| format!("Failed to start process instance of '{}'", definition.id))?;
            (pvm.take_effects(), pvm.take_history())
        };
        let follow_ups = Self::collect_follow_ups(&mut instance, effects, true);
        let ended = instance.ended;
        self.store.save(instance).await?;
        drop(guard);
        if ended {
            self.release_lock(id, lock);
        }

        info!(process_instance = %id, definition = %definition.id, "process instance started");
        self.dispatch_history(history).await;
        Ok((id, follow_ups))
    }

    /// Runs `command` against a copy of the instance and commits it on success.
    /// `completes_super` is false for commands that cancel the instance.
    async fn execute_command<R>(
        &self,
        instance_id: Uuid,
        completes_super: bool,
        command: impl FnOnce(&mut Interpreter<'_>) -> Result<R, PvmError> + Send,
    ) -> Result<R> {
        let (result, follow_ups) = self.run_command(instance_id, completes_super, command).await?;
        self.run_follow_ups(follow_ups).await?;
        Ok(result)
    }

    async fn run_command<R>(
        &self,
        instance_id: Uuid,
        completes_super: bool,
        command: impl FnOnce(&mut Interpreter<'_>) -> Result<R, PvmError> + Send,
    ) -> Result<(R, Vec<FollowUp>)> {
        let lock = self.lock_for(instance_id);
        let guard = lock.lock().await;

        let mut instance = self.load(instance_id).await?;
        if instance.ended {
            drop(guard);
            self.release_lock(instance_id, lock);
            bail!(PvmError::InstanceEnded(instance_id));
        }
        let definition = self.definition(&instance.definition_id)?;
        let (result, effects, history) = {
            let mut pvm = Interpreter::new(&mut instance.tree, &definition, &self.services);
            let result = command(&mut pvm)?;
            (result, pvm.take_effects(), pvm.take_history())
        };
        let follow_ups = Self::collect_follow_ups(&mut instance, effects, completes_super);
        let ended = instance.ended;
        self.store.save(instance).await?;
        drop(guard);
        if ended {
            self.release_lock(instance_id, lock);
        }

        self.dispatch_history(history).await;
        Ok((result, follow_ups))
    }

    fn collect_follow_ups(instance: &mut ProcessInstance, effects: Vec<Effect>, completes_super: bool) -> Vec<FollowUp> {
        let mut follow_ups = Vec::new();
        for effect in effects {
            match effect {
                Effect::StartCalledInstance {
                    record,
                    definition_id,
                    variables,
                    ..
                } => follow_ups.push(FollowUp::StartCalledInstance {
                    super_execution: SuperExecution {
                        process_instance_id: instance.id,
                        called_instance: record,
                    },
                    definition_id,
                    variables,
                }),
            }
        }
        for orphan in std::mem::take(&mut instance.tree.orphaned_called_instances) {
            follow_ups.push(FollowUp::DeleteCalledInstance(orphan));
        }

        instance.refresh_state();
        if instance.ended && completes_super {
            if let Some(super_execution) = instance.super_execution {
                follow_ups.push(FollowUp::CompleteCallActivity {
                    super_execution,
                    variables: instance.tree.variables_local(instance.tree.root()),
                });
            }
        }
        follow_ups
    }

    async fn run_follow_ups(&self, follow_ups: Vec<FollowUp>) -> Result<()> {
        let mut queue: VecDeque<FollowUp> = follow_ups.into();
        while let Some(follow_up) = queue.pop_front() {
            debug!(?follow_up, "follow-up");
            let more = match follow_up {
                FollowUp::StartCalledInstance {
                    super_execution,
                    definition_id,
                    variables,
                } => {
                    let (id, more) = self
                        .create_instance(&definition_id, None, variables, Some(super_execution))
                        .await?;
                    self.link_called_instance(super_execution, id).await?;
                    more
                }
                FollowUp::CompleteCallActivity {
                    super_execution,
                    variables,
                } => self.complete_call_activity(super_execution, variables).await?,
                FollowUp::DeleteCalledInstance(id) => match self.store.load(id).await? {
                    Some(called) if !called.ended => {
                        let (_, more) = self
                            .run_command(id, false, |pvm| {
                                pvm.delete_process_instance("super execution deleted", false, false)
                            })
                            .await?;
                        more
                    }
                    _ => Vec::new(),
                },
            };
            queue.extend(more);
        }
        Ok(())
    }

    /// Stores the id of a started called instance on its call activity record.
    async fn link_called_instance(&self, super_execution: SuperExecution, called_id: Uuid) -> Result<()> {
        let lock = self.lock_for(super_execution.process_instance_id);
        let _guard = lock.lock().await;
        let Some(mut instance) = self.store.load(super_execution.process_instance_id).await? else {
            return Ok(());
        };
        if let Some(record) = instance.tree.called_instances.get_mut(&super_execution.called_instance) {
            record.process_instance_id = Some(called_id);
            self.store.save(instance).await?;
        }
        Ok(())
    }

    async fn complete_call_activity(
        &self,
        super_execution: SuperExecution,
        variables: BTreeMap<String, Value>,
    ) -> Result<Vec<FollowUp>> {
        let super_id = super_execution.process_instance_id;
        let Some(instance) = self.store.load(super_id).await? else {
            warn!(process_instance = %super_id, "calling process instance is gone");
            return Ok(Vec::new());
        };
        let Some(execution) = instance
            .tree
            .called_instances
            .get(&super_execution.called_instance)
            .and_then(|r| r.execution)
        else {
            warn!(process_instance = %super_id, record = %super_execution.called_instance, "call activity no longer waits");
            return Ok(Vec::new());
        };
        let payload = Value::Object(variables.into_iter().collect());
        let (_, more) = self
            .run_command(super_id, true, |pvm| {
                pvm.signal(execution, CALLED_INSTANCE_COMPLETED, &payload)
            })
            .await?;
        Ok(more)
    }

    async fn record_job_failure(&self, instance_id: Uuid, job: RecordId, err: &anyhow::Error) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;
        let Some(mut instance) = self.store.load(instance_id).await? else {
            return Ok(());
        };
        let Some(record) = instance.tree.jobs.get_mut(&job) else {
            return Ok(());
        };
        if record.retries == 0 {
            return Ok(());
        }
        record.retries -= 1;
        record.exception_message = Some(err.to_string());
        let (retries, execution, activity_id) = (record.retries, record.execution, record.activity_id.clone());
        warn!(process_instance = %instance_id, job = %job, retries, "job failed: {:#}", err);
        if retries == 0 {
            if let Some(execution) = execution {
                instance
                    .tree
                    .create_incident(execution, &activity_id, "failedJob", &err.to_string(), Some(job));
            }
        }
        self.store.save(instance).await
    }

    async fn dispatch_history(&self, events: Vec<HistoryEvent>) {
        let Some(handler) = &self.history else {
            return;
        };
        for event in events {
            if let Err(err) = handler.handle(event).await {
                warn!("Failed to dispatch history event: {}", err);
            }
        }
    }
}
