/// Hot-reload process registry using ArcSwap
///
/// Keeps every stored definition validated, linked and shared behind an
/// `Arc`. Updates swap the whole map atomically, so lookups never block and
/// passes already running keep the definition they started with.

use crate::process::graph::validate_definition;
use crate::process::storage::ProcessStorage;
use crate::process::types::ProcessDefinition;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free process registry
#[derive(Debug)]
pub struct ProcessRegistry {
    /// Key: process id
    processes: ArcSwap<HashMap<String, CompiledProcess>>,
    storage: ProcessStorage,
}

/// Validated and linked definition
#[derive(Debug, Clone)]
pub struct CompiledProcess {
    pub definition: Arc<ProcessDefinition>,
}

impl ProcessRegistry {
    pub fn new(storage: ProcessStorage) -> Self {
        Self {
            processes: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    pub fn storage(&self) -> &ProcessStorage {
        &self.storage
    }

    /// Load and compile every stored definition
    ///
    /// A definition that no longer validates is skipped with an error log
    /// rather than taking the whole registry down.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_processes().await?;
        let mut compiled = HashMap::new();
        for (id, definition) in stored {
            match compile_process(definition) {
                Ok(process) => {
                    compiled.insert(id, process);
                }
                Err(e) => tracing::error!("❌ Skipping invalid process '{}': {}", id, e),
            }
        }

        self.processes.store(Arc::new(compiled));
        tracing::info!("Initialized process registry with {} processes", self.processes.load().len());
        Ok(())
    }

    /// Re-read one definition from storage and swap it in
    pub async fn reload_process(&self, process_id: &str) -> Result<()> {
        let definition = self
            .storage
            .get_process(process_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Process not found: {}", process_id))?;
        let compiled = compile_process(definition)?;

        let current = self.processes.load();
        let mut next = (**current).clone();
        next.insert(process_id.to_string(), compiled);
        self.processes.store(Arc::new(next));

        tracing::info!("Hot-reloaded process: {}", process_id);
        Ok(())
    }

    pub fn get_process(&self, process_id: &str) -> Option<CompiledProcess> {
        self.processes.load().get(process_id).cloned()
    }

    pub fn list_process_ids(&self) -> Vec<String> {
        self.processes.load().keys().cloned().collect()
    }

    pub fn remove_process(&self, process_id: &str) {
        let current = self.processes.load();
        let mut next = (**current).clone();
        if next.remove(process_id).is_some() {
            self.processes.store(Arc::new(next));
            tracing::info!("Removed process from registry: {}", process_id);
        }
    }
}

/// Validate a definition and link it
pub fn compile_process(mut definition: ProcessDefinition) -> Result<CompiledProcess> {
    validate_definition(&definition)?;
    definition.link();
    Ok(CompiledProcess { definition: Arc::new(definition) })
}
