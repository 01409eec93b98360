/// Bpelway: continuation-based business process engine
///
/// This library provides a process engine that executes structured activity
/// trees (sequence, flow, scope with fault handlers, throw, wait, invoke,
/// pick, reply, assign, exit) over a persistent continuation store, with
/// every execution pass committed transactionally to SQLite.

// Core configuration and setup
pub mod config;

// Process definition layer - types, validation, storage and registry
pub mod process;

// Runtime - channels, continuation store, interpreter, transactional host
pub mod runtime;

// Durable instance storage and transaction management
pub mod persistence;

// HTTP API layer - REST endpoints for processes and instances
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use process::{ActivityKind, NodeId, ProcessBuilder, ProcessDefinition, QName};
pub use runtime::{ExecutionHost, InstanceOutcome, PassTrigger, ProcessEngine, ProcessInstance};
pub use server::start_server;
