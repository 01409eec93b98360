/// Process engine: the service-level entry point for instances
///
/// Launches instances, delivers external messages to them, terminates them
/// on request, and reports their status. Every state change runs as one
/// transactional pass through [`ExecutionHost`] over SQLite. Passes for the
/// same instance are serialized by a per-instance lock; different instances
/// run concurrently.

use crate::config::EngineConfig;
use crate::persistence::{Database, SqliteTransactionManager};
use crate::process::registry::ProcessRegistry;
use crate::runtime::channel::{ChannelId, ChannelKind, Message};
use crate::runtime::context::{Effect, ExecutionContext, VariableRef};
use crate::runtime::host::{ExecutionHost, HostError, InstanceStatus, PassReport, PassTrigger, ProcessInstance};
use crate::runtime::soup::{InstanceOutcome, Soup, PROCESS_SCOPE};
use crate::runtime::timers::{TimerFired, TimerService};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Process variable that receives the launch payload
pub const INPUT_VARIABLE: &str = "input";

#[derive(Debug, Error)]
pub enum ProcessEngineError {
    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("instance {0} already finished")]
    InstanceFinished(Uuid),

    #[error("instance {instance} was started from version {expected} of its process, registry has {found}")]
    DefinitionChanged { instance: Uuid, expected: u32, found: u32 },

    #[error("'{0}' cannot be delivered from outside the engine")]
    NotExternal(&'static str),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A channel an instance is waiting on that external parties may post to
#[derive(Debug, Clone, Serialize)]
pub struct AwaitedChannel {
    pub channel: ChannelId,
    pub kind: ChannelKind,
}

/// Externally visible snapshot of an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub id: Uuid,
    pub process_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub outcome: Option<InstanceOutcome>,
    pub awaiting: Vec<AwaitedChannel>,
    pub variables: BTreeMap<String, Value>,
}

impl InstanceView {
    fn from_instance(instance: &ProcessInstance) -> Self {
        Self::build(
            instance.id,
            &instance.definition.id,
            instance.definition.version,
            &instance.soup,
            instance.context.variables().clone(),
        )
    }

    fn build(id: Uuid, process_id: &str, version: u32, soup: &Soup, variables: BTreeMap<String, Value>) -> Self {
        Self {
            id,
            process_id: process_id.to_string(),
            definition_version: version,
            status: InstanceStatus::of(soup),
            outcome: soup.outcome().cloned(),
            awaiting: soup
                .awaited_external_channels()
                .into_iter()
                .map(|(channel, kind)| AwaitedChannel { channel, kind })
                .collect(),
            variables,
        }
    }
}

type PassLocks = StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>;

/// Exclusive right to run passes for one instance
///
/// Dropping the lease releases the pass lock and forgets the instance's
/// entry once no other pass is queued on it.
struct PassLease<'a> {
    locks: &'a PassLocks,
    instance_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PassLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.instance_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.instance_id);
        }
    }
}

pub struct ProcessEngine {
    db: Database,
    registry: Arc<ProcessRegistry>,
    config: EngineConfig,
    /// Per-instance pass locks, present only while a pass runs or waits
    locks: PassLocks,
    timers: TimerService,
    timer_rx: Mutex<Option<mpsc::UnboundedReceiver<TimerFired>>>,
}

impl ProcessEngine {
    pub async fn new(db: Database, registry: Arc<ProcessRegistry>, config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = TimerService::new(tx).await?;
        Ok(Arc::new(Self {
            db,
            registry,
            config,
            locks: StdMutex::new(HashMap::new()),
            timers,
            timer_rx: Mutex::new(Some(rx)),
        }))
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Start the timer service, re-arm timers of running instances and spawn the delivery loop
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.timers.start().await?;
        let rearmed = self.recover_timers().await?;
        tracing::info!("⏰ Re-armed {} timers from running instances", rearmed);

        let Some(mut rx) = self.timer_rx.lock().await.take() else {
            return Err(anyhow::anyhow!("Process engine already started"));
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(fired) = rx.recv().await {
                match engine.deliver(fired.instance_id, fired.timer, Message::TimerFired).await {
                    Ok(report) => tracing::debug!(
                        "⏰ Timer {} delivered to {} ({:?})",
                        fired.timer,
                        fired.instance_id,
                        report.delivered
                    ),
                    Err(e) => tracing::warn!("⚠️ Timer {} for {} not delivered: {}", fired.timer, fired.instance_id, e),
                }
            }
            tracing::debug!("⏹️ Timer delivery loop finished");
        });
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.timers.stop().await
    }

    /// Create an instance of a process and run it until it first waits
    pub async fn launch(&self, process_id: &str, input: Option<Value>) -> Result<InstanceView, ProcessEngineError> {
        let compiled = self
            .registry
            .get_process(process_id)
            .ok_or_else(|| ProcessEngineError::ProcessNotFound(process_id.to_string()))?;

        let mut instance = ProcessInstance::new(compiled.definition);
        if let Some(input) = input {
            let var = VariableRef { scope: PROCESS_SCOPE, name: INPUT_VARIABLE.to_string() };
            instance.context.initialize_variable(&var, input);
        }

        let _lease = self.lease(instance.id).await;

        tracing::info!("🚀 Launching instance {} of process '{}'", instance.id, process_id);
        let report = self.run_pass(&mut instance, PassTrigger::Start).await?;
        self.dispatch_effects(instance.id, &report.effects).await;
        Ok(InstanceView::from_instance(&instance))
    }

    /// Deliver a message from an external party (partner reply, timer, pick match)
    pub async fn deliver(
        &self,
        instance_id: Uuid,
        channel: ChannelId,
        message: Message,
    ) -> Result<PassReport, ProcessEngineError> {
        if !is_external(&message) {
            return Err(ProcessEngineError::NotExternal(message.label()));
        }
        self.pass(instance_id, PassTrigger::Deliver { channel, message }).await
    }

    /// Ask a running instance to terminate
    pub async fn terminate(&self, instance_id: Uuid) -> Result<PassReport, ProcessEngineError> {
        tracing::info!("🛑 Termination requested for instance {}", instance_id);
        self.pass(instance_id, PassTrigger::Terminate).await
    }

    /// Current snapshot of an instance, straight from storage
    pub async fn status(&self, instance_id: Uuid) -> Result<InstanceView, ProcessEngineError> {
        let stored = self
            .db
            .load_instance(instance_id)
            .await?
            .ok_or(ProcessEngineError::InstanceNotFound(instance_id))?;
        let soup = Soup::deserialize(&stored.soup).map_err(HostError::from)?;
        Ok(InstanceView::build(
            stored.id,
            &stored.process_id,
            stored.definition_version,
            &soup,
            stored.context.variables().clone(),
        ))
    }

    async fn pass(&self, instance_id: Uuid, trigger: PassTrigger) -> Result<PassReport, ProcessEngineError> {
        let _lease = self.lease(instance_id).await;

        let mut instance = self.load_instance(instance_id).await?;
        if instance.status().is_terminal() {
            return Err(ProcessEngineError::InstanceFinished(instance_id));
        }

        let report = self.run_pass(&mut instance, trigger).await?;
        self.dispatch_effects(instance_id, &report.effects).await;
        Ok(report)
    }

    async fn run_pass(&self, instance: &mut ProcessInstance, trigger: PassTrigger) -> Result<PassReport, HostError> {
        let tm = SqliteTransactionManager::new(self.db.pool().clone());
        let mut host = ExecutionHost::new(tm, self.config.clone());
        host.run_pass(instance, trigger).await
    }

    /// Rebuild an instance, refusing to run it against a different definition version
    async fn load_instance(&self, instance_id: Uuid) -> Result<ProcessInstance, ProcessEngineError> {
        let stored = self
            .db
            .load_instance(instance_id)
            .await?
            .ok_or(ProcessEngineError::InstanceNotFound(instance_id))?;
        let compiled = self
            .registry
            .get_process(&stored.process_id)
            .ok_or_else(|| ProcessEngineError::ProcessNotFound(stored.process_id.clone()))?;

        if compiled.definition.version != stored.definition_version {
            return Err(ProcessEngineError::DefinitionChanged {
                instance: instance_id,
                expected: stored.definition_version,
                found: compiled.definition.version,
            });
        }

        ProcessInstance::restore(instance_id, compiled.definition, &stored.soup, stored.context)
            .map_err(|e| ProcessEngineError::Host(HostError::Engine(e)))
    }

    /// Wait for the pass lock of an instance
    async fn lease(&self, instance_id: Uuid) -> PassLease<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(instance_id).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let guard = lock.lock_owned().await;
        PassLease { locks: &self.locks, instance_id, guard: Some(guard) }
    }

    /// Act on committed effects; everything is already durable in the outbox
    async fn dispatch_effects(&self, instance_id: Uuid, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::RegisterTimer { timer, fire_at } => {
                    if let Err(e) = self.timers.schedule(instance_id, *timer, *fire_at).await {
                        tracing::error!("❌ Failed to arm timer {} for {}: {}", timer, instance_id, e);
                    }
                }
                Effect::CancelTimer { timer } => self.timers.cancel(instance_id, *timer).await,
                Effect::Invoke { partner, operation, exchange_id, .. } => {
                    tracing::info!("📤 Invoke {}.{} queued in outbox ({})", partner, operation, exchange_id);
                }
                Effect::Reply { partner, operation, exchange_id, .. } => {
                    tracing::info!("📨 Reply to {}.{} queued in outbox ({})", partner, operation, exchange_id);
                }
                Effect::Select { response, selectors, .. } => {
                    tracing::debug!("👂 Instance {} listening on {} for {} operations", instance_id, response, selectors.len());
                }
                Effect::Event { event } => tracing::debug!("📣 {}: {:?}", instance_id, event),
            }
        }
    }

    /// Re-arm timers of running instances from the outbox
    ///
    /// Folds RegisterTimer/CancelTimer per instance and keeps only timers
    /// whose channel is still awaited.
    async fn recover_timers(&self) -> anyhow::Result<usize> {
        let mut rearmed = 0;
        for instance_id in self.db.running_instance_ids().await? {
            let Some(stored) = self.db.load_instance(instance_id).await? else {
                continue;
            };
            let soup = match Soup::deserialize(&stored.soup) {
                Ok(soup) => soup,
                Err(e) => {
                    tracing::error!("❌ Instance {} has unreadable state, skipping timers: {}", instance_id, e);
                    continue;
                }
            };
            let awaited: Vec<ChannelId> = soup
                .awaited_external_channels()
                .into_iter()
                .filter(|(_, kind)| *kind == ChannelKind::Timer)
                .map(|(channel, _)| channel)
                .collect();

            let mut armed = BTreeMap::new();
            for effect in self.db.load_effects(instance_id).await? {
                match effect {
                    Effect::RegisterTimer { timer, fire_at } => {
                        armed.insert(timer, fire_at);
                    }
                    Effect::CancelTimer { timer } => {
                        armed.remove(&timer);
                    }
                    _ => {}
                }
            }

            for (timer, fire_at) in armed {
                if awaited.contains(&timer) {
                    self.timers.schedule(instance_id, timer, fire_at).await?;
                    rearmed += 1;
                }
            }
        }
        Ok(rearmed)
    }
}

/// Messages external parties may post
fn is_external(message: &Message) -> bool {
    matches!(
        message,
        Message::InvokeResponse { .. } | Message::InvokeFault { .. } | Message::TimerFired | Message::PickResponse { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::storage::ProcessStorage;
    use crate::process::types::{ActivityKind, Deadline, ProcessBuilder, ProcessDefinition};
    use chrono::Utc;
    use std::time::Duration;

    async fn registry_with(db: &Database, definition: ProcessDefinition) -> Arc<ProcessRegistry> {
        let storage = ProcessStorage::new(db.pool().clone());
        storage.save_process(&definition).await.unwrap();
        let registry = Arc::new(ProcessRegistry::new(storage));
        registry.init_from_storage().await.unwrap();
        registry
    }

    fn lock_count(engine: &ProcessEngine) -> usize {
        engine.locks.lock().unwrap().len()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pass_locks_are_released_after_every_pass() {
        let db = Database::in_memory().await.unwrap();
        let mut b = ProcessBuilder::new("instant");
        let root = b.add(ActivityKind::Empty);
        let registry = registry_with(&db, b.build(root).unwrap()).await;
        let engine = ProcessEngine::new(db, registry, EngineConfig { max_steps_per_pass: 1_000 }).await.unwrap();

        for _ in 0..3 {
            let view = engine.launch("instant", None).await.unwrap();
            assert_eq!(view.status, InstanceStatus::Completed);
        }
        assert_eq!(lock_count(&engine), 0);

        let finished = engine.launch("instant", None).await.unwrap().id;
        assert!(matches!(engine.terminate(finished).await, Err(ProcessEngineError::InstanceFinished(_))));
        assert!(matches!(engine.terminate(Uuid::new_v4()).await, Err(ProcessEngineError::InstanceNotFound(_))));
        assert_eq!(lock_count(&engine), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restarted_engine_fires_overdue_timers() {
        let db = Database::in_memory().await.unwrap();
        let mut b = ProcessBuilder::new("overdue");
        let root = b.add(ActivityKind::Wait {
            deadline: Deadline { for_seconds: None, until: Some(Utc::now() - chrono::Duration::hours(1)) },
        });
        let registry = registry_with(&db, b.build(root).unwrap()).await;
        let config = EngineConfig { max_steps_per_pass: 1_000 };

        // never started, so its scheduler never fires the armed timer
        let crashed = ProcessEngine::new(db.clone(), Arc::clone(&registry), config.clone()).await.unwrap();
        let id = crashed.launch("overdue", None).await.unwrap().id;
        assert_eq!(crashed.status(id).await.unwrap().status, InstanceStatus::Running);
        drop(crashed);

        let engine = ProcessEngine::new(db, registry, config).await.unwrap();
        engine.start().await.unwrap();

        let mut status = InstanceStatus::Running;
        for _ in 0..100 {
            status = engine.status(id).await.unwrap().status;
            if status != InstanceStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(status, InstanceStatus::Completed);
        engine.stop().await.unwrap();
    }
}
