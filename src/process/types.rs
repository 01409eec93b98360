/// Core process definition types
///
/// Defines the immutable activity tree that every process instance executes.
/// Definitions are stored as JSON in SQLite and linked (index + parent
/// back-references) before they are handed to the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Structural identity of an activity within its owning definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Namespace-qualified name, used for fault names
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QName {
    #[serde(default)]
    pub namespace: String,
    pub local: String,
}

impl QName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local)
        }
    }
}

/// A complete process definition: an arena of activity nodes plus a root
///
/// Nodes reference their children by `NodeId`; the tree is strictly
/// child-of-parent. `parent` links and the id index are rebuilt by
/// [`ProcessDefinition::link`] and are never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique process identifier (e.g., "order-fulfilment")
    pub id: String,
    /// Human-readable process name
    pub name: String,
    /// Definition version, bumped by storage on every save
    #[serde(default = "default_version")]
    pub version: u32,
    /// Variables declared at process scope
    #[serde(default)]
    pub variables: Vec<String>,
    /// Correlation sets declared at process scope
    #[serde(default)]
    pub correlation_sets: Vec<String>,
    /// Root activity of the process scope
    pub root: NodeId,
    /// All activities of this process
    pub nodes: Vec<ActivityNode>,
    #[serde(skip)]
    index: HashMap<NodeId, usize>,
}

fn default_version() -> u32 {
    1
}

/// A single activity in the definition tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityNode {
    pub id: NodeId,
    /// Optional human-readable name, used in logs and events
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ActivityKind,
    /// Lookup-only back-reference, filled in by linking
    #[serde(skip)]
    pub parent: Option<NodeId>,
}

/// Closed set of activity kinds understood by the interpreter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    /// No-op, completes immediately
    Empty,
    /// Runs children one after another in declaration order
    Sequence { children: Vec<NodeId> },
    /// Runs children concurrently, done when all are terminal
    Flow { children: Vec<NodeId> },
    /// Raises a named fault, optionally carrying a variable as fault data
    Throw {
        fault_name: QName,
        #[serde(default)]
        fault_variable: Option<String>,
        #[serde(default)]
        fault_type: Option<String>,
    },
    /// Lexical unit owning variables, correlation sets and a fault handler
    Scope {
        body: NodeId,
        #[serde(default)]
        fault_handler: Option<FaultHandler>,
        #[serde(default)]
        variables: Vec<String>,
        #[serde(default)]
        correlation_sets: Vec<String>,
    },
    /// Suspends until a timer fires
    Wait {
        #[serde(flatten)]
        deadline: Deadline,
    },
    /// Calls a partner operation
    Invoke {
        partner: String,
        operation: String,
        input_variable: String,
        #[serde(default)]
        output_variable: Option<String>,
    },
    /// Waits for the first of several correlated messages, or an alarm
    Pick {
        on_message: Vec<OnMessage>,
        #[serde(default)]
        on_alarm: Option<OnAlarm>,
    },
    /// Answers the request opened by a previous Pick
    Reply {
        partner: String,
        operation: String,
        #[serde(default)]
        variable: Option<String>,
        #[serde(default)]
        fault_name: Option<QName>,
    },
    /// Copies values into variables
    Assign { copies: Vec<CopySpec> },
    /// Terminates the whole instance
    Exit,
}

impl ActivityKind {
    /// Short lowercase label for logs and events
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::Empty => "empty",
            ActivityKind::Sequence { .. } => "sequence",
            ActivityKind::Flow { .. } => "flow",
            ActivityKind::Throw { .. } => "throw",
            ActivityKind::Scope { .. } => "scope",
            ActivityKind::Wait { .. } => "wait",
            ActivityKind::Invoke { .. } => "invoke",
            ActivityKind::Pick { .. } => "pick",
            ActivityKind::Reply { .. } => "reply",
            ActivityKind::Assign { .. } => "assign",
            ActivityKind::Exit => "exit",
        }
    }

    /// Direct children of this activity, in declaration order
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            ActivityKind::Sequence { children } | ActivityKind::Flow { children } => children.clone(),
            ActivityKind::Scope { body, fault_handler, .. } => {
                let mut out = vec![*body];
                if let Some(handler) = fault_handler {
                    out.extend(handler.catches.iter().map(|c| c.activity));
                }
                out
            }
            ActivityKind::Pick { on_message, on_alarm } => {
                let mut out: Vec<NodeId> = on_message.iter().map(|m| m.activity).collect();
                if let Some(alarm) = on_alarm {
                    out.push(alarm.activity);
                }
                out
            }
            _ => Vec::new(),
        }
    }
}

/// Ordered catch blocks of a scope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultHandler {
    pub catches: Vec<Catch>,
}

/// A single catch block
///
/// With neither `fault_name` nor `fault_type` set, the catch matches any fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catch {
    #[serde(default)]
    pub fault_name: Option<QName>,
    #[serde(default)]
    pub fault_type: Option<String>,
    /// Scope variable that receives the fault data
    #[serde(default)]
    pub fault_variable: Option<String>,
    pub activity: NodeId,
}

/// Either a relative or an absolute timer deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deadline {
    #[serde(default)]
    pub for_seconds: Option<u64>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

/// Longest relative deadline a definition may declare (100 years)
pub const MAX_DEADLINE_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

impl Deadline {
    /// Resolve against the current time; absolute wins over relative
    ///
    /// `None` when the offset does not land on a representable instant.
    pub fn resolve(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.until, self.for_seconds) {
            (Some(until), _) => Some(until),
            (None, Some(secs)) => i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|offset| now.checked_add_signed(offset)),
            (None, None) => Some(now),
        }
    }
}

/// Message branch of a Pick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnMessage {
    pub partner: String,
    pub operation: String,
    /// Variable that receives the message payload
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default)]
    pub correlation: Option<CorrelationSpec>,
    pub activity: NodeId,
}

/// Alarm branch of a Pick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnAlarm {
    #[serde(flatten)]
    pub deadline: Deadline,
    pub activity: NodeId,
}

/// Correlation used by a message branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSpec {
    /// Correlation set name
    pub set: String,
    /// Initiate the set from the received payload when not yet initialized
    #[serde(default)]
    pub initiate: bool,
    /// JSONPath into the payload that yields the correlation value (e.g. "$.orderId")
    pub property: String,
}

/// One copy operation of an Assign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopySpec {
    pub from: CopySource,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CopySource {
    Literal { value: Value },
    Variable {
        name: String,
        /// Optional JSONPath selecting part of the variable
        #[serde(default)]
        path: Option<String>,
    },
}

impl ProcessDefinition {
    /// Look up a node by id (requires a linked definition)
    pub fn node(&self, id: NodeId) -> Option<&ActivityNode> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    /// Iterate the scopes enclosing `id`, innermost first
    ///
    /// Walks parent back-references; the node itself is included when it is a scope.
    pub fn enclosing_scopes(&self, id: NodeId) -> impl Iterator<Item = &ActivityNode> + '_ {
        std::iter::successors(self.node(id), move |n| n.parent.and_then(|p| self.node(p)))
            .filter(|n| matches!(n.kind, ActivityKind::Scope { .. }))
    }

    /// Build the id index and parent back-references
    ///
    /// Structural validation (unknown references, shared children, cycles)
    /// is done by [`crate::process::graph::validate_definition`] before linking.
    pub fn link(&mut self) {
        self.index = self.nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
        let mut parents = HashMap::new();
        for node in &self.nodes {
            for child in node.kind.children() {
                parents.insert(child, node.id);
            }
        }
        for node in &mut self.nodes {
            node.parent = parents.get(&node.id).copied();
        }
    }

    pub fn is_linked(&self) -> bool {
        self.index.len() == self.nodes.len()
    }
}

/// Programmatic construction of definitions
///
/// Mirrors how definitions are assembled node by node; `build` validates and links.
#[derive(Debug)]
pub struct ProcessBuilder {
    id: String,
    name: String,
    variables: Vec<String>,
    correlation_sets: Vec<String>,
    nodes: Vec<ActivityNode>,
}

impl ProcessBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            variables: Vec::new(),
            correlation_sets: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn variable(mut self, name: impl Into<String>) -> Self {
        self.variables.push(name.into());
        self
    }

    pub fn correlation_set(mut self, name: impl Into<String>) -> Self {
        self.correlation_sets.push(name.into());
        self
    }

    /// Add an activity and return its id
    pub fn add(&mut self, kind: ActivityKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(ActivityNode { id, name: None, kind, parent: None });
        id
    }

    /// Validate, link and return the definition rooted at `root`
    pub fn build(self, root: NodeId) -> anyhow::Result<ProcessDefinition> {
        let mut definition = ProcessDefinition {
            id: self.id,
            name: self.name,
            version: 1,
            variables: self.variables,
            correlation_sets: self.correlation_sets,
            root,
            nodes: self.nodes,
            index: HashMap::new(),
        };
        crate::process::graph::validate_definition(&definition)?;
        definition.link();
        Ok(definition)
    }
}
