/// Execution context: the engine's boundary to its external collaborators
///
/// The interpreter never touches variables, partners or timers directly; it
/// calls through [`ExecutionContext`]. `InstanceContext` is the engine's own
/// implementation: it keeps variables and correlation sets as serializable
/// instance state and journals every externally visible request as an
/// [`Effect`], which the transactional host writes to the outbox inside the
/// pass transaction.

use crate::process::types::QName;
use crate::runtime::channel::{ChannelId, ScopeInstanceId};
use crate::runtime::fault::{uninitialized_variable, FaultSignal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A variable bound to the scope instance that declares it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableRef {
    pub scope: ScopeInstanceId,
    pub name: String,
}

/// A correlation set bound to the scope instance that declares it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationRef {
    pub scope: ScopeInstanceId,
    pub set: String,
}

/// Value identifying the conversation a correlation set belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(pub Value);

/// Fault raised by a collaborator; the interpreter attaches the origin activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFault {
    pub name: QName,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ContextFault {
    pub fn new(name: QName) -> Self {
        Self { name, data: None }
    }
}

pub type ContextResult<T> = Result<T, ContextFault>;

/// Result of a partner invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvokeOutcome {
    /// The partner answered synchronously
    Completed { response: Value },
    /// The response will arrive later on the response channel
    Pending { exchange_id: String },
}

/// One acceptable inbound message of a pick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub partner: String,
    pub operation: String,
    #[serde(default)]
    pub correlation: Option<CorrelationKey>,
}

/// Body of a reply to an open request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyBody {
    Message { payload: Value },
    Fault { fault_name: QName, payload: Value },
}

/// Fire-and-forget observability events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstanceEvent {
    ActivityStarted { node: u32, kind: String },
    ActivityTerminated { node: u32 },
    ActivityFaulted { node: u32, fault: QName },
    FaultCaught { scope: u32, fault: QName, catch_index: usize },
    ProcessCompleted,
    ProcessFaulted { fault: QName },
    ProcessTerminated,
}

/// Externally visible request journaled during a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    Invoke {
        partner: String,
        operation: String,
        payload: Value,
        response: ChannelId,
        exchange_id: String,
    },
    Reply {
        partner: String,
        operation: String,
        exchange_id: String,
        body: ReplyBody,
    },
    RegisterTimer { timer: ChannelId, fire_at: DateTime<Utc> },
    CancelTimer { timer: ChannelId },
    Select {
        response: ChannelId,
        #[serde(default)]
        timeout: Option<DateTime<Utc>>,
        selectors: Vec<Selector>,
    },
    Event { event: InstanceEvent },
}

/// Services the interpreter consumes from its environment
///
/// Implementations must tolerate being called only from within a pass; the
/// transactional host is responsible for making their effects atomic.
pub trait ExecutionContext {
    fn instance_id(&self) -> Uuid;
    fn now(&self) -> DateTime<Utc>;

    fn is_variable_initialized(&self, var: &VariableRef) -> bool;
    /// Read a variable; faults with `uninitializedVariable` when never written
    fn read_variable(&self, var: &VariableRef) -> ContextResult<Value>;
    fn initialize_variable(&mut self, var: &VariableRef, value: Value);
    fn commit_variable(&mut self, var: &VariableRef, value: Value);

    fn is_correlation_initialized(&self, cset: &CorrelationRef) -> bool;
    fn read_correlation(&self, cset: &CorrelationRef) -> Option<CorrelationKey>;
    fn write_correlation(&mut self, cset: &CorrelationRef, key: CorrelationKey);

    fn invoke(&mut self, partner: &str, operation: &str, payload: Value, response: ChannelId)
        -> ContextResult<InvokeOutcome>;
    fn reply(&mut self, partner: &str, operation: &str, exchange_id: &str, body: ReplyBody) -> ContextResult<()>;

    fn register_timer(&mut self, timer: ChannelId, fire_at: DateTime<Utc>);
    fn cancel_timer(&mut self, timer: ChannelId);
    fn select(&mut self, response: ChannelId, timeout: Option<DateTime<Utc>>, selectors: &[Selector])
        -> ContextResult<()>;

    fn send_event(&mut self, event: InstanceEvent);

    fn completed_ok(&mut self);
    fn completed_fault(&mut self, fault: &FaultSignal);
    fn terminated(&mut self);
}

/// The engine's serializable execution context for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceContext {
    instance_id: Uuid,
    /// Keyed "scope:name"
    variables: BTreeMap<String, Value>,
    /// Keyed "scope:set"
    correlations: BTreeMap<String, CorrelationKey>,
    #[serde(skip)]
    journal: Vec<Effect>,
}

impl InstanceContext {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            variables: BTreeMap::new(),
            correlations: BTreeMap::new(),
            journal: Vec::new(),
        }
    }

    /// Drain the effects journaled since the last call
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.journal)
    }

    pub fn effects(&self) -> &[Effect] {
        &self.journal
    }

    /// Current value of a variable, if initialized
    pub fn variable(&self, var: &VariableRef) -> Option<&Value> {
        self.variables.get(&variable_key(var))
    }

    /// All initialized variables keyed "scope:name"
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }
}

fn variable_key(var: &VariableRef) -> String {
    format!("{}:{}", var.scope.0, var.name)
}

fn correlation_key(cset: &CorrelationRef) -> String {
    format!("{}:{}", cset.scope.0, cset.set)
}

impl ExecutionContext for InstanceContext {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn is_variable_initialized(&self, var: &VariableRef) -> bool {
        self.variables.contains_key(&variable_key(var))
    }

    fn read_variable(&self, var: &VariableRef) -> ContextResult<Value> {
        self.variables.get(&variable_key(var)).cloned().ok_or_else(|| ContextFault {
            name: uninitialized_variable(),
            data: Some(Value::String(var.name.clone())),
        })
    }

    fn initialize_variable(&mut self, var: &VariableRef, value: Value) {
        self.variables.insert(variable_key(var), value);
    }

    fn commit_variable(&mut self, var: &VariableRef, value: Value) {
        self.variables.insert(variable_key(var), value);
    }

    fn is_correlation_initialized(&self, cset: &CorrelationRef) -> bool {
        self.correlations.contains_key(&correlation_key(cset))
    }

    fn read_correlation(&self, cset: &CorrelationRef) -> Option<CorrelationKey> {
        self.correlations.get(&correlation_key(cset)).cloned()
    }

    fn write_correlation(&mut self, cset: &CorrelationRef, key: CorrelationKey) {
        self.correlations.insert(correlation_key(cset), key);
    }

    fn invoke(
        &mut self,
        partner: &str,
        operation: &str,
        payload: Value,
        response: ChannelId,
    ) -> ContextResult<InvokeOutcome> {
        // Partner transport lives outside the engine; replies come back via post
        let exchange_id = format!("{}-{}", self.instance_id, response.0);
        self.journal.push(Effect::Invoke {
            partner: partner.to_string(),
            operation: operation.to_string(),
            payload,
            response,
            exchange_id: exchange_id.clone(),
        });
        Ok(InvokeOutcome::Pending { exchange_id })
    }

    fn reply(&mut self, partner: &str, operation: &str, exchange_id: &str, body: ReplyBody) -> ContextResult<()> {
        self.journal.push(Effect::Reply {
            partner: partner.to_string(),
            operation: operation.to_string(),
            exchange_id: exchange_id.to_string(),
            body,
        });
        Ok(())
    }

    fn register_timer(&mut self, timer: ChannelId, fire_at: DateTime<Utc>) {
        self.journal.push(Effect::RegisterTimer { timer, fire_at });
    }

    fn cancel_timer(&mut self, timer: ChannelId) {
        self.journal.push(Effect::CancelTimer { timer });
    }

    fn select(
        &mut self,
        response: ChannelId,
        timeout: Option<DateTime<Utc>>,
        selectors: &[Selector],
    ) -> ContextResult<()> {
        self.journal.push(Effect::Select {
            response,
            timeout,
            selectors: selectors.to_vec(),
        });
        Ok(())
    }

    fn send_event(&mut self, event: InstanceEvent) {
        self.journal.push(Effect::Event { event });
    }

    fn completed_ok(&mut self) {
        self.send_event(InstanceEvent::ProcessCompleted);
    }

    fn completed_fault(&mut self, fault: &FaultSignal) {
        self.send_event(InstanceEvent::ProcessFaulted { fault: fault.name.clone() });
    }

    fn terminated(&mut self) {
        self.send_event(InstanceEvent::ProcessTerminated);
    }
}
