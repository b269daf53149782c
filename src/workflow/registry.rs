//! Definition Registry
//!
//! In-memory store of workflow and agent definitions keyed by identifier.
//! Definitions are stored behind `Arc` so a replacement swaps the whole value
//! and readers holding the previous version are unaffected.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use log::{debug, info};

use super::model::Definition;
use super::validator::validate_definition;
use crate::error::{EngineError, Result};

/// Read-mostly map of registered definitions.
#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<Definition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a definition, replacing any previous one with the same id.
    ///
    /// An invalid definition is rejected with `InvalidDefinition` and nothing is stored.
    pub fn register(&self, definition: Definition) -> Result<Arc<Definition>> {
        validate_definition(&definition)?;

        let definition = Arc::new(definition);
        let previous = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), Arc::clone(&definition));

        match previous {
            Some(old) => info!(
                "Replaced definition '{}' (version {} -> {})",
                definition.id, old.version, definition.version
            ),
            None => info!(
                "Registered {:?} definition '{}' with {} steps",
                definition.kind,
                definition.id,
                definition.steps.len()
            ),
        }

        Ok(definition)
    }

    /// Returns an enabled definition, or `NotFound`.
    pub fn get(&self, id: &str) -> Result<Arc<Definition>> {
        let definitions = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        match definitions.get(id) {
            Some(def) if def.enabled => Ok(Arc::clone(def)),
            Some(_) => {
                debug!("Definition '{}' is disabled", id);
                Err(EngineError::NotFound(id.to_string()))
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    /// Marks a definition enabled or disabled by registering an updated copy.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let current = definitions
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let mut updated = Definition::clone(current);
        updated.enabled = enabled;
        updated.updated_at = Utc::now();
        definitions.insert(id.to_string(), Arc::new(updated));

        info!(
            "Definition '{}' {}",
            id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Removes a definition. Returns it if it was registered.
    pub fn remove(&self, id: &str) -> Option<Arc<Definition>> {
        let removed = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            info!("Removed definition '{}'", id);
        }
        removed
    }

    /// Identifiers of every registered definition, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
