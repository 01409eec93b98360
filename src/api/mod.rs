/// HTTP API Layer
///
/// This module provides the REST API endpoints for process management
/// and instance operations. It handles:
/// - Process definition CRUD with hot reload
/// - Instance launch, inspection and termination
/// - Delivery of external messages onto instance channels

// Process definition endpoints (POST/GET/PUT/DELETE)
pub mod processes;

// Instance endpoints
pub mod instances;

// Re-export router builders
pub use instances::create_instance_routes;
pub use processes::{create_process_routes, AppState};
