/// Process Runtime
///
/// This module provides the continuation-based execution engine for process
/// instances. It handles:
/// - Channels and the messages they carry
/// - The continuation store (soup) and its versioned persistence format
/// - The activity interpreter and fault propagation
/// - The channel runtime that drives an instance to quiescence
/// - Transactional passes, timers and the service-level engine

// Channel identities, capabilities and messages
pub mod channel;

// Boundary to variables, partners, timers and events
pub mod context;

// Internal (non-business) engine errors
pub mod error;

// Fault signals and propagation rules
pub mod fault;

// Continuation store
pub mod soup;

// Per-activity semantics
pub mod interpreter;

// Channel runtime: post, execute_step, run_to_quiescence
pub mod vpu;

// Transactional execution host
pub mod host;

// Background timer service
pub mod timers;

// Service-level process engine
pub mod engine;

// Re-export main types
pub use channel::{ChannelId, ChannelKind, Message, PostOutcome};
pub use context::{ExecutionContext, InstanceContext};
pub use engine::{InstanceView, ProcessEngine, ProcessEngineError};
pub use error::EngineError;
pub use host::{ExecutionHost, HostError, InstanceStatus, PassReport, PassTrigger, ProcessInstance};
pub use soup::{InstanceOutcome, Soup};
pub use vpu::ChannelRuntime;
