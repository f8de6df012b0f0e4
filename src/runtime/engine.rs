use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::runtime::definition::ProcessDefinition;
use crate::runtime::event::TimerJob;
use crate::runtime::instance::ProcessInstance;
use crate::runtime::job::{InMemoryJobQueue, Job, JobQueue};

/// One instance behind its mutex, and a flag raised once it has ended.
struct InstanceCell {
    instance: Mutex<ProcessInstance>,
    ended: watch::Sender<bool>,
}

/// Async driver around the synchronous interpreter.
///
/// Keeps deployed definitions and live instances. Each instance sits behind
/// its own mutex, so calls on one instance are serialised while different
/// instances proceed in parallel. Timers registered by an instance are turned
/// into jobs that `run_worker` delivers back once they are due.
///
/// An instance leaves the live table as soon as it ends. It stays queryable
/// until `purge_finished` unless the config says not to retain it.
pub struct Engine {
    config: EngineConfig,
    definitions: DashMap<String, Arc<ProcessDefinition>>,
    instances: DashMap<Uuid, Arc<InstanceCell>>,
    finished: DashMap<Uuid, Arc<InstanceCell>>,
    queue: Arc<dyn JobQueue>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let queue = Arc::new(InMemoryJobQueue::new(config.job_queue_capacity));
        Self {
            config,
            definitions: DashMap::new(),
            instances: DashMap::new(),
            finished: DashMap::new(),
            queue,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn deploy(&self, definition: Arc<ProcessDefinition>) {
        info!(process = %definition.id(), "deployed process definition");
        self.definitions.insert(definition.id().to_string(), definition);
    }

    pub fn definition(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(id).map(|d| d.clone())
    }

    pub async fn start_process(&self, definition_id: &str, variables: HashMap<String, Value>) -> Result<Uuid> {
        let definition = self
            .definition(definition_id)
            .ok_or_else(|| anyhow!("Process definition not found: {}", definition_id))?;
        let instance = definition.create_process_instance();
        self.launch(instance, variables).await
    }

    /// Starts at `activity_id` instead of the initial activity.
    pub async fn start_process_at(
        &self,
        definition_id: &str,
        activity_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<Uuid> {
        let definition = self
            .definition(definition_id)
            .ok_or_else(|| anyhow!("Process definition not found: {}", definition_id))?;
        let instance = definition.create_process_instance_at(activity_id)?;
        self.launch(instance, variables).await
    }

    async fn launch(&self, mut instance: ProcessInstance, variables: HashMap<String, Value>) -> Result<Uuid> {
        let instance_id = instance.id();
        instance.set_variables(variables)?;
        let (ended, _) = watch::channel(false);
        let cell = Arc::new(InstanceCell {
            instance: Mutex::new(instance),
            ended,
        });
        self.instances.insert(instance_id, cell);
        self.with_instance(instance_id, |i| i.start()).await?;
        Ok(instance_id)
    }

    fn cell(&self, instance_id: Uuid) -> Option<Arc<InstanceCell>> {
        self.instances
            .get(&instance_id)
            .or_else(|| self.finished.get(&instance_id))
            .map(|c| c.clone())
    }

    /// Runs `f` with exclusive access to the instance, then schedules any
    /// timers it registered.
    pub async fn with_instance<R>(
        &self,
        instance_id: Uuid,
        f: impl FnOnce(&mut ProcessInstance) -> Result<R>,
    ) -> Result<R> {
        let cell = self
            .cell(instance_id)
            .ok_or_else(|| anyhow!("Instance not found: {}", instance_id))?;
        self.run_on(instance_id, &cell, f).await
    }

    async fn run_on<R>(
        &self,
        instance_id: Uuid,
        cell: &Arc<InstanceCell>,
        f: impl FnOnce(&mut ProcessInstance) -> Result<R>,
    ) -> Result<R> {
        let mut instance = cell.instance.lock().await;
        let result = f(&mut instance);
        let timers = instance.drain_scheduled_timers();
        let ended = instance.is_ended();
        drop(instance);
        self.schedule(instance_id, timers);
        if ended {
            self.retire(instance_id, cell);
        }
        result
    }

    /// Moves an ended instance out of the live table and wakes its waiters.
    fn retire(&self, instance_id: Uuid, cell: &Arc<InstanceCell>) {
        if !self.instances.contains_key(&instance_id) {
            return;
        }
        cell.ended.send_replace(true);
        // queryable in one table or the other at every point
        if self.config.retain_finished_instances {
            self.finished.insert(instance_id, cell.clone());
        }
        self.instances.remove(&instance_id);
        debug!(instance_id = %instance_id, retained = self.config.retain_finished_instances, "instance retired");
    }

    /// Resolves once the instance has ended.
    pub async fn wait_until_ended(&self, instance_id: Uuid) -> Result<()> {
        let cell = self
            .cell(instance_id)
            .ok_or_else(|| anyhow!("Instance not found: {}", instance_id))?;
        let mut ended = cell.ended.subscribe();
        ended.wait_for(|done| *done).await?;
        Ok(())
    }

    /// Forgets every ended instance; returns how many were dropped.
    pub fn purge_finished(&self) -> usize {
        let count = self.finished.len();
        self.finished.clear();
        info!(count, "purged finished instances");
        count
    }

    pub async fn signal(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        signal_name: Option<&str>,
        data: Option<Value>,
    ) -> Result<()> {
        self.with_instance(instance_id, |i| i.signal_activity(activity_id, signal_name, data))
            .await
    }

    pub async fn message(&self, instance_id: Uuid, name: &str, data: Option<Value>) -> Result<bool> {
        self.with_instance(instance_id, |i| i.message_event_received(name, data))
            .await
    }

    /// Delivers a signal event to every live instance.
    pub async fn broadcast_signal(&self, name: &str, data: Option<Value>) -> Result<usize> {
        let live: Vec<(Uuid, Arc<InstanceCell>)> = self
            .instances
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut delivered = 0;
        for (id, cell) in live {
            let payload = data.clone();
            delivered += self
                .run_on(id, &cell, |i| {
                    if i.is_ended() {
                        return Ok(0);
                    }
                    i.signal_event_received(name, payload)
                })
                .await?;
        }
        Ok(delivered)
    }

    pub async fn delete(&self, instance_id: Uuid, reason: &str) -> Result<()> {
        self.with_instance(instance_id, |i| i.delete_cascade(reason)).await
    }

    pub async fn active_activity_ids(&self, instance_id: Uuid) -> Result<Vec<String>> {
        self.with_instance(instance_id, |i| Ok(i.find_active_activity_ids()))
            .await
    }

    pub async fn is_ended(&self, instance_id: Uuid) -> Result<bool> {
        self.with_instance(instance_id, |i| Ok(i.is_ended())).await
    }

    pub async fn get_instance_var(&self, instance_id: Uuid, key: &str) -> Option<Value> {
        self.with_instance(instance_id, |i| Ok(i.get_variable(key)))
            .await
            .ok()
            .flatten()
    }

    pub async fn get_instance_vars(&self, instance_id: Uuid) -> Result<HashMap<String, Value>> {
        self.with_instance(instance_id, |i| Ok(i.get_variables())).await
    }

    /// Instances that have not ended yet.
    pub fn instance_ids(&self) -> Vec<Uuid> {
        self.instances.iter().map(|e| *e.key()).collect()
    }

    fn schedule(&self, instance_id: Uuid, timers: Vec<TimerJob>) {
        for timer in timers {
            let delay = self.config.scaled(timer.due_in);
            let queue = self.queue.clone();
            let job = Job {
                instance_id,
                subscription_id: timer.subscription_id,
                activity_id: timer.activity_id,
            };
            debug!(instance_id = %instance_id, activity = %job.activity_id, ?delay, "timer scheduled");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = queue.push(job).await {
                    error!("Failed to schedule timer job (channel closed?): {}", e);
                }
            });
        }
    }

    /// Fires due timers until the queue closes or, when configured, stays
    /// idle for longer than the worker idle timeout.
    pub async fn run_worker(&self) {
        info!("Worker started.");
        loop {
            let next = match self.config.worker_idle_timeout() {
                Some(idle) => match timeout(idle, self.queue.pop()).await {
                    Ok(r) => r,
                    Err(_) => {
                        info!("Worker idle, stopping.");
                        break;
                    }
                },
                None => self.queue.pop().await,
            };
            let job = match next {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = ?e, "Failed to pop job");
                    break;
                }
            };
            if let Err(e) = self.process_job(&job).await {
                error!(instance_id = %job.instance_id, activity = %job.activity_id, error = ?e, "Job failed");
            }
        }
    }

    async fn process_job(&self, job: &Job) -> Result<()> {
        let Some(cell) = self.instances.get(&job.instance_id).map(|c| c.clone()) else {
            if self.finished.contains_key(&job.instance_id) {
                debug!(instance_id = %job.instance_id, "timer of ended instance ignored");
            } else {
                warn!(instance_id = %job.instance_id, "Instance not found for job");
            }
            return Ok(());
        };
        let subscription = job.subscription_id;
        self.run_on(job.instance_id, &cell, |i| {
            if !i.has_subscription(subscription) {
                // cancelled since it was scheduled
                debug!(subscription, "stale timer ignored");
                return Ok(());
            }
            i.fire_timer(subscription)
        })
        .await
    }
}
