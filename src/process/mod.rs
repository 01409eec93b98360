/// Process definition layer
///
/// Definition types, structural validation, SQLite storage and the
/// hot-reload registry that hands linked definitions to the runtime.

pub mod graph;
pub mod registry;
pub mod storage;
pub mod types;

pub use registry::{CompiledProcess, ProcessRegistry};
pub use storage::{ProcessMetadata, ProcessStorage};
pub use types::{ActivityKind, ActivityNode, NodeId, ProcessBuilder, ProcessDefinition, QName};
