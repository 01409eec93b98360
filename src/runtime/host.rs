/// Transactional execution host
///
/// Wraps every pass over a process instance in a transaction: begin, run the
/// channel runtime to quiescence on a working copy of the instance state,
/// write the new continuation blob and the journaled effects, then commit.
/// Any failure, or a transaction marked rollback-only, rolls the pass back
/// and leaves the in-memory instance exactly as it was.
///
/// Host states: Idle → Running → (Committing | Aborting) → Idle.

use crate::config::EngineConfig;
use crate::persistence::transaction::{
    ContinuationRecord, ContinuationStorage, TransactionError, TransactionManager, TransactionStatus,
};
use crate::process::types::ProcessDefinition;
use crate::runtime::channel::{ChannelId, Message, PostOutcome};
use crate::runtime::context::{Effect, InstanceContext};
use crate::runtime::error::EngineError;
use crate::runtime::interpreter::Continuation;
use crate::runtime::soup::{InstanceOutcome, Soup, PROCESS_SCOPE};
use crate::runtime::vpu::ChannelRuntime;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Externally visible lifecycle of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but no pass has run yet
    Ready,
    Running,
    Completed,
    Faulted,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Ready => "ready",
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Faulted => "faulted",
            InstanceStatus::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ready" => Some(InstanceStatus::Ready),
            "running" => Some(InstanceStatus::Running),
            "completed" => Some(InstanceStatus::Completed),
            "faulted" => Some(InstanceStatus::Faulted),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Faulted | InstanceStatus::Terminated)
    }

    /// Derive the status from a continuation store
    pub fn of(soup: &Soup) -> Self {
        match soup.outcome() {
            Some(InstanceOutcome::Completed) => InstanceStatus::Completed,
            Some(InstanceOutcome::Faulted { .. }) => InstanceStatus::Faulted,
            Some(InstanceOutcome::Terminated) => InstanceStatus::Terminated,
            None if is_fresh(soup) => InstanceStatus::Ready,
            None => InstanceStatus::Running,
        }
    }
}

fn is_fresh(soup: &Soup) -> bool {
    soup.sequence() == PROCESS_SCOPE.0 + 1
}

/// One process instance: definition, continuation store and execution context
#[derive(Debug, Clone)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition: Arc<ProcessDefinition>,
    pub soup: Soup,
    pub context: InstanceContext,
}

impl ProcessInstance {
    pub fn new(definition: Arc<ProcessDefinition>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            definition,
            soup: Soup::new(),
            context: InstanceContext::new(id),
        }
    }

    /// Rebuild an instance from persisted state
    pub fn restore(
        id: Uuid,
        definition: Arc<ProcessDefinition>,
        soup_blob: &[u8],
        context: InstanceContext,
    ) -> Result<Self, EngineError> {
        let soup = Soup::deserialize(soup_blob)?;
        Ok(Self { id, definition, soup, context })
    }

    /// Nothing has ever run against this instance
    pub fn is_fresh(&self) -> bool {
        is_fresh(&self.soup)
    }

    pub fn outcome(&self) -> Option<&InstanceOutcome> {
        self.soup.outcome()
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::of(&self.soup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Idle,
    Running,
    Committing,
    Aborting,
}

/// What starts a pass
#[derive(Debug, Clone)]
pub enum PassTrigger {
    /// Inject the process entry reaction into a fresh instance
    Start,
    /// Post an external message on a channel
    Deliver { channel: ChannelId, message: Message },
    /// Ask the root activity to terminate
    Terminate,
}

/// Summary of a committed pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub steps: usize,
    pub status: InstanceStatus,
    pub outcome: Option<InstanceOutcome>,
    pub effects: Vec<Effect>,
    /// Result of the triggering post, for deliveries
    pub delivered: Option<PostOutcome>,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("transaction was marked rollback-only; pass rolled back")]
    MarkedRollback,

    #[error("invalid host state: {0}")]
    InvalidState(String),
}

/// Runs passes over instances inside transactions of `T`
pub struct ExecutionHost<T> {
    tm: T,
    config: EngineConfig,
    state: HostState,
}

struct StagedPass {
    soup: Soup,
    context: InstanceContext,
    report: PassReport,
}

impl<T> ExecutionHost<T>
where
    T: TransactionManager + ContinuationStorage,
{
    pub fn new(tm: T, config: EngineConfig) -> Self {
        Self {
            tm,
            config,
            state: HostState::Idle,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn transaction_manager(&self) -> &T {
        &self.tm
    }

    pub fn transaction_manager_mut(&mut self) -> &mut T {
        &mut self.tm
    }

    /// Run one transactional pass
    ///
    /// On success the instance holds the committed state; on any error it is untouched.
    pub async fn run_pass(&mut self, instance: &mut ProcessInstance, trigger: PassTrigger) -> Result<PassReport, HostError> {
        if self.state != HostState::Idle {
            return Err(HostError::InvalidState(format!("pass requested while {:?}", self.state)));
        }

        self.state = HostState::Running;
        if let Err(e) = self.tm.begin().await {
            self.state = HostState::Idle;
            return Err(e.into());
        }
        tracing::debug!("🔄 Pass started for instance {}", instance.id);

        let staged = match self.execute(instance, trigger).await {
            Ok(staged) => staged,
            Err(e) => {
                tracing::error!("❌ Pass for instance {} failed: {}", instance.id, e);
                if self.tm.status() == TransactionStatus::Active {
                    if let Err(mark) = self.tm.set_rollback_only() {
                        tracing::debug!("Could not mark transaction rollback-only: {}", mark);
                    }
                }
                self.abort().await;
                return Err(e);
            }
        };

        if self.tm.status() == TransactionStatus::MarkedRollback {
            tracing::warn!("↩️ Instance {} pass marked rollback-only, rolling back", instance.id);
            self.abort().await;
            return Err(HostError::MarkedRollback);
        }

        self.state = HostState::Committing;
        if let Err(e) = self.tm.commit().await {
            tracing::error!("❌ Commit failed for instance {}: {}", instance.id, e);
            self.abort().await;
            return Err(e.into());
        }

        instance.soup = staged.soup;
        instance.context = staged.context;
        self.state = HostState::Idle;

        tracing::debug!(
            "💾 Pass committed for instance {} ({} steps, status {:?})",
            instance.id,
            staged.report.steps,
            staged.report.status
        );
        Ok(staged.report)
    }

    async fn abort(&mut self) {
        self.state = HostState::Aborting;
        if let Err(e) = self.tm.rollback().await {
            tracing::warn!("⚠️ Rollback failed: {}", e);
        }
        self.state = HostState::Idle;
    }

    async fn execute(&mut self, instance: &ProcessInstance, trigger: PassTrigger) -> Result<StagedPass, HostError> {
        let mut soup = instance.soup.clone();
        let mut context = instance.context.clone();

        let (steps, delivered) = {
            let mut runtime = ChannelRuntime::new(&mut soup, &instance.definition, &mut context, &self.config);
            let delivered = match trigger {
                PassTrigger::Start => {
                    if !instance.is_fresh() {
                        return Err(HostError::InvalidState(format!("instance {} already started", instance.id)));
                    }
                    runtime.inject(Continuation::Process)?;
                    None
                }
                PassTrigger::Deliver { channel, message } => Some(runtime.post(channel, message)?),
                PassTrigger::Terminate => match runtime.soup().root_termination() {
                    Some(root) => Some(runtime.post(root, Message::Terminate)?),
                    None => return Err(HostError::InvalidState(format!("instance {} has no root", instance.id))),
                },
            };
            (runtime.run_to_quiescence()?, delivered)
        };

        let effects = context.take_effects();
        let outcome = soup.outcome().cloned();
        let status = InstanceStatus::of(&soup);

        let record = ContinuationRecord {
            instance_id: instance.id,
            process_id: instance.definition.id.clone(),
            definition_version: instance.definition.version,
            status,
            outcome: outcome.clone(),
            soup: soup.serialize()?,
            context: context.clone(),
        };
        self.tm.write_continuation(&record).await?;
        self.tm.write_effects(instance.id, &effects).await?;

        Ok(StagedPass {
            soup,
            context,
            report: PassReport { steps, status, outcome, effects, delivered },
        })
    }
}
