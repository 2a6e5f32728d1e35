//! Definition registry
//!
//! Maps definition ids to descriptors. Registration walks the whole
//! dependency closure once, so a cyclic graph is rejected here instead of
//! sending the resolver into a loop that cannot converge.

use std::collections::{HashMap, HashSet};

use crate::definition::Definition;
use crate::error::{EngineError, Result};
use crate::types::DefinitionId;

/// Registry of every definition the engine has seen
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    entries: HashMap<DefinitionId, Definition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition and its full dependency closure
    ///
    /// Fails without registering anything when the closure contains a
    /// cycle or reuses an id for a different descriptor.
    pub fn register(&mut self, definition: &Definition) -> Result<()> {
        let mut closure = Vec::new();
        let mut done = HashSet::new();
        let mut path = Vec::new();
        visit(definition, &mut path, &mut done, &mut closure)?;

        for candidate in &closure {
            if let Some(existing) = self.entries.get(candidate.id()) {
                if !existing.same_descriptor(candidate) {
                    return Err(EngineError::DuplicateDefinitionId {
                        id: candidate.id().to_string(),
                    });
                }
            }
        }

        for candidate in closure {
            if !self.entries.contains_key(candidate.id()) {
                log::debug!("Registered definition '{}'", candidate.id());
                self.entries.insert(candidate.id().to_string(), candidate);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Definition> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Depth-first walk collecting the closure and detecting back edges
fn visit(
    definition: &Definition,
    path: &mut Vec<DefinitionId>,
    done: &mut HashSet<DefinitionId>,
    closure: &mut Vec<Definition>,
) -> Result<()> {
    if done.contains(definition.id()) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|id| id == definition.id()) {
        let mut cycle = path[start..].to_vec();
        cycle.push(definition.id().to_string());
        log::error!("Rejected cyclic dependency: {}", cycle.join(" -> "));
        return Err(EngineError::CyclicDependency { path: cycle });
    }

    path.push(definition.id().to_string());
    for (_, dependency) in definition.dependencies() {
        visit(&dependency, path, done, closure)?;
    }
    path.pop();

    done.insert(definition.id().to_string());
    closure.push(definition.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DefinitionBuilder, DependencyList};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_register_collects_closure() {
        let c = DefinitionBuilder::new().id("c").build();
        let a = DefinitionBuilder::new().id("a").dependency("c", &c).build();
        let b = DefinitionBuilder::new().id("b").dependency("c", &c).build();
        let d = DefinitionBuilder::new()
            .id("d")
            .dependency("a", &a)
            .dependency("b", &b)
            .build();

        let mut registry = DefinitionRegistry::new();
        registry.register(&d).unwrap();
        assert_eq!(registry.len(), 4);
        assert!(registry.contains("c"));

        // Re-registering the same descriptors is a no-op
        registry.register(&a).unwrap();
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let slot: Arc<Mutex<DependencyList>> = Arc::new(Mutex::new(Vec::new()));
        let deferred = Arc::clone(&slot);
        let a = DefinitionBuilder::new()
            .id("a")
            .dependencies_with(move || deferred.lock().unwrap().clone())
            .build();
        let b = DefinitionBuilder::new().id("b").dependency("a", &a).build();
        slot.lock().unwrap().push(("b".to_string(), b.clone()));

        let mut registry = DefinitionRegistry::new();
        match registry.register(&b) {
            Err(EngineError::CyclicDependency { path }) => {
                assert_eq!(path, vec!["b", "a", "b"]);
            }
            other => panic!("Expected CyclicDependency, got {:?}", other),
        }
        assert!(registry.is_empty());

        // Break the cycle so the Arc graph can be dropped
        slot.lock().unwrap().clear();
    }

    #[test]
    fn test_deferred_dependencies_must_reuse_handles() {
        let shared = DefinitionBuilder::new().id("shared").build();
        let captured = shared.clone();
        let stable = DefinitionBuilder::new()
            .id("stable")
            .dependencies_with(move || vec![("shared".to_string(), captured.clone())])
            .build();

        let rebuilt = DefinitionBuilder::new()
            .id("rebuilt")
            .dependencies_with(|| {
                vec![(
                    "fresh".to_string(),
                    DefinitionBuilder::new().id("fresh").build(),
                )]
            })
            .build();

        let mut registry = DefinitionRegistry::new();
        registry.register(&stable).unwrap();
        registry.register(&stable).unwrap();
        assert!(registry.get("shared").unwrap().same_descriptor(&shared));

        registry.register(&rebuilt).unwrap();
        let err = registry.register(&rebuilt).unwrap_err();
        match err {
            EngineError::DuplicateDefinitionId { id } => assert_eq!(id, "fresh"),
            other => panic!("Expected DuplicateDefinitionId, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let first = DefinitionBuilder::new().id("same").build();
        let second = DefinitionBuilder::new().id("same").build();

        let mut registry = DefinitionRegistry::new();
        registry.register(&first).unwrap();
        let err = registry.register(&second).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDefinitionId { .. }));
        assert!(err.is_configuration());
    }
}
