//! Registry of saga definitions, keyed by name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{Result, SagaDefinition, SagaError};

/// Explicit registry handed to the orchestrator at construction.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<SagaDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition. Names must be unique.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        let name = definition.name().to_string();
        if self.definitions.contains_key(&name) {
            return Err(SagaError::DuplicateDefinitionName(name));
        }
        tracing::debug!(definition = %name, steps = definition.len(), "registered saga definition");
        self.definitions.insert(name, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.get(name).cloned()
    }

    /// Like [`get`](Self::get), but a missing name is an error.
    pub fn require(&self, name: &str) -> Result<Arc<SagaDefinition>> {
        self.get(name)
            .ok_or_else(|| SagaError::UnknownDefinition(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Every command type any registered definition can emit, deduplicated.
    pub fn command_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .definitions
            .values()
            .flat_map(|d| d.command_types().map(str::to_string).collect::<Vec<_>>())
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn definition(name: &str) -> SagaDefinition {
        SagaDefinition::builder(name)
            .add_step("a", "a.do", "a.undo", Duration::from_secs(1), 0)
            .build()
            .unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = DefinitionRegistry::new();
        registry.register(definition("one")).unwrap();
        registry.register(definition("two")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["one", "two"]);
        assert_eq!(registry.require("one").unwrap().name(), "one");
        assert!(matches!(
            registry.require("three"),
            Err(SagaError::UnknownDefinition(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = DefinitionRegistry::new();
        registry.register(definition("one")).unwrap();
        assert!(matches!(
            registry.register(definition("one")),
            Err(SagaError::DuplicateDefinitionName(name)) if name == "one"
        ));
    }

    #[test]
    fn command_types_are_deduplicated() {
        let mut registry = DefinitionRegistry::new();
        registry.register(definition("one")).unwrap();
        registry.register(definition("two")).unwrap();
        assert_eq!(registry.command_types(), vec!["a.do", "a.undo"]);
    }
}
