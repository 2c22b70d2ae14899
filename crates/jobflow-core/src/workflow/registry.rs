//! In-memory registry of loaded workflow definitions, keyed by name.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use jobflow_types::workflow::WorkflowDefinition;

use super::definition::{WorkflowError, discover_workflows, validate_definition};

/// Validated definitions available for triggering.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every valid definition under `dir`. Returns how many were loaded.
    ///
    /// When two files declare the same name, the one sorting last wins.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, WorkflowError> {
        let found = discover_workflows(dir)?;
        let count = found.len();
        for (path, def) in found {
            if self.definitions.contains_key(&def.name) {
                tracing::warn!(?path, workflow = %def.name, "duplicate workflow name, replacing");
            }
            self.definitions.insert(def.name.clone(), Arc::new(def));
        }
        tracing::info!(dir = %dir.display(), count, "loaded workflow definitions");
        Ok(count)
    }

    /// Validate and add (or replace) one definition.
    pub fn register(&self, def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        validate_definition(&def)?;
        let def = Arc::new(def);
        self.definitions.insert(def.name.clone(), Arc::clone(&def));
        Ok(def)
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(name).map(|d| Arc::clone(d.value()))
    }

    /// All definitions, sorted by name.
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut defs: Vec<_> = self.definitions.iter().map(|d| Arc::clone(d.value())).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn remove(&self, name: &str) -> bool {
        self.definitions.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
