//! Dependency resolution
//!
//! Flattens dependency trees, determines which definitions are active, and
//! classifies active definitions as invalid in dependency order.
//!
//! # Ordering
//!
//! The topological order is computed by fixed-point iteration: each sweep
//! accepts every remaining definition whose transitive dependencies are
//! already accepted. A sweep that accepts nothing means the graph cannot be
//! ordered, which is reported instead of looping.

use std::collections::HashSet;

use crate::definition::Definition;
use crate::error::{EngineError, Result};
use crate::params::{build_parameters, ParameterCache};
use crate::registry::DefinitionRegistry;
use crate::types::{DefinitionId, Stage, StatusTable, Store, Subscription};

/// Expand a definition's transitive dependencies, depth first
///
/// Keeps first-seen order and is not deduplicated: a definition reached
/// through two paths appears twice.
pub fn flatten_dependencies(definition: &Definition) -> Vec<Definition> {
    let mut flattened = Vec::new();
    for (_, dependency) in definition.dependencies() {
        let nested = flatten_dependencies(&dependency);
        flattened.push(dependency);
        flattened.extend(nested);
    }
    flattened
}

/// Distinct transitive dependency ids of a definition
///
/// Terminates on cyclic graphs; a definition on a cycle lists itself.
pub fn dependency_ids(definition: &Definition) -> HashSet<DefinitionId> {
    let mut ids = HashSet::new();
    let mut pending = definition.dependencies();
    while let Some((_, dependency)) = pending.pop() {
        if ids.insert(dependency.id().to_string()) {
            pending.extend(dependency.dependencies());
        }
    }
    ids
}

/// Definitions referenced by at least one subscription
///
/// Deduplicated by id, in order of first subscription.
pub fn active_definitions(
    subscriptions: &[Subscription],
    registry: &DefinitionRegistry,
) -> Vec<Definition> {
    let mut seen = HashSet::new();
    let mut active = Vec::new();
    for subscription in subscriptions {
        if !seen.insert(subscription.definition_id.as_str()) {
            continue;
        }
        match registry.get(&subscription.definition_id) {
            Some(definition) => active.push(definition.clone()),
            None => log::warn!(
                "Subscription to unregistered definition '{}' ignored",
                subscription.definition_id
            ),
        }
    }
    active
}

/// Order definitions so that each comes after all of its dependencies
///
/// Dependencies outside `definitions` do not constrain the order.
pub fn topological_order(definitions: &[Definition]) -> Result<Vec<Definition>> {
    let members: HashSet<&str> = definitions.iter().map(|d| d.id()).collect();
    let requirements: Vec<HashSet<DefinitionId>> = definitions
        .iter()
        .map(|definition| {
            dependency_ids(definition)
                .into_iter()
                .filter(|id| members.contains(id.as_str()))
                .collect()
        })
        .collect();

    let mut accepted: HashSet<DefinitionId> = HashSet::new();
    let mut ordered = Vec::with_capacity(definitions.len());

    while ordered.len() < definitions.len() {
        let mut progressed = false;
        for (definition, required) in definitions.iter().zip(&requirements) {
            if accepted.contains(definition.id()) {
                continue;
            }
            if required.iter().all(|id| accepted.contains(id)) {
                accepted.insert(definition.id().to_string());
                ordered.push(definition.clone());
                progressed = true;
            }
        }
        if !progressed {
            let remaining: Vec<DefinitionId> = definitions
                .iter()
                .filter(|d| !accepted.contains(d.id()))
                .map(|d| d.id().to_string())
                .collect();
            log::error!("Dependency ordering stalled on: {}", remaining.join(", "));
            return Err(EngineError::NoTopologicalOrder { remaining });
        }
    }

    Ok(ordered)
}

/// Active definitions whose data is not currently trustworthy
///
/// In dependency order, a definition is invalid when one of its transitive
/// dependencies was already found invalid, or when it is `IDLE` and its
/// availability predicate now fails. Definitions in any other stage are
/// left alone so an ongoing operation is not re-triggered by a pass.
pub fn invalid_definitions(
    active: &[Definition],
    store: &Store,
    status: &StatusTable,
    cache: &mut ParameterCache,
) -> Result<Vec<Definition>> {
    let ordered = topological_order(active)?;
    let mut invalid_ids: HashSet<DefinitionId> = HashSet::new();
    let mut invalid = Vec::new();

    for definition in ordered {
        let propagated = dependency_ids(&definition)
            .iter()
            .any(|id| invalid_ids.contains(id));

        let is_invalid = if propagated {
            true
        } else if status.get(definition.id()) != Some(&Stage::Idle) {
            false
        } else {
            let params = build_parameters(&definition, store, status, Some(&mut *cache));
            !definition.is_data_available(&params)
        };

        if is_invalid {
            invalid_ids.insert(definition.id().to_string());
            invalid.push(definition);
        }
    }

    Ok(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DefinitionBuilder, DependencyList};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct Diamond {
        a: Definition,
        b: Definition,
        c: Definition,
        d: Definition,
    }

    /// d -> {a, b}, a -> c, b -> c
    fn diamond() -> Diamond {
        let c = DefinitionBuilder::new().id("c").store_id("sc").build();
        let a = DefinitionBuilder::new().id("a").store_id("sa").dependency("c", &c).build();
        let b = DefinitionBuilder::new().id("b").store_id("sb").dependency("c", &c).build();
        let d = DefinitionBuilder::new()
            .id("d")
            .store_id("sd")
            .dependency("a", &a)
            .dependency("b", &b)
            .build();
        Diamond { a, b, c, d }
    }

    fn ids(definitions: &[Definition]) -> Vec<&str> {
        definitions.iter().map(|d| d.id()).collect()
    }

    #[test]
    fn test_flatten_keeps_repeats_in_depth_first_order() {
        let g = diamond();
        assert_eq!(ids(&flatten_dependencies(&g.d)), vec!["a", "c", "b", "c"]);
        assert!(flatten_dependencies(&g.c).is_empty());
        assert_eq!(dependency_ids(&g.d).len(), 3);
    }

    #[test]
    fn test_active_definitions_dedupes_in_subscription_order() {
        let g = diamond();
        let mut registry = DefinitionRegistry::new();
        registry.register(&g.d).unwrap();

        let subs = vec![
            Subscription::new("s1", "b"),
            Subscription::new("s2", "a"),
            Subscription::new("s3", "b"),
            Subscription::new("s4", "missing"),
        ];
        assert_eq!(ids(&active_definitions(&subs, &registry)), vec!["b", "a"]);
    }

    #[test]
    fn test_topological_order_places_dependencies_first() {
        let g = diamond();
        let ordered = topological_order(&[g.d.clone(), g.b.clone(), g.a.clone(), g.c.clone()]).unwrap();
        let position = |id: &str| ordered.iter().position(|d| d.id() == id).unwrap();

        assert!(position("c") < position("a"));
        assert!(position("c") < position("b"));
        assert!(position("a") < position("d"));
        assert!(position("b") < position("d"));
    }

    #[test]
    fn test_mutual_dependencies_have_no_order() {
        let a_deps: Arc<Mutex<DependencyList>> = Arc::new(Mutex::new(Vec::new()));
        let b_deps: Arc<Mutex<DependencyList>> = Arc::new(Mutex::new(Vec::new()));
        let (from_a, from_b) = (Arc::clone(&a_deps), Arc::clone(&b_deps));
        let a = DefinitionBuilder::new()
            .id("a")
            .dependencies_with(move || from_a.lock().unwrap().clone())
            .build();
        let b = DefinitionBuilder::new()
            .id("b")
            .dependencies_with(move || from_b.lock().unwrap().clone())
            .build();
        a_deps.lock().unwrap().push(("b".to_string(), b.clone()));
        b_deps.lock().unwrap().push(("a".to_string(), a.clone()));

        assert!(dependency_ids(&a).contains("a"));
        let err = topological_order(&[a.clone(), b.clone()]).unwrap_err();
        assert!(err.is_configuration());
        match err {
            EngineError::NoTopologicalOrder { mut remaining } => {
                remaining.sort();
                assert_eq!(remaining, vec!["a", "b"]);
            }
            other => panic!("Expected NoTopologicalOrder, got {:?}", other),
        }

        a_deps.lock().unwrap().clear();
        b_deps.lock().unwrap().clear();
    }

    #[test]
    fn test_invalid_propagates_down_the_chain() {
        let g = diamond();
        let active = vec![g.d.clone(), g.a.clone(), g.b.clone(), g.c.clone()];

        let mut store = Store::new();
        for slot in ["sa", "sb", "sd"] {
            store.insert(slot.into(), json!(true));
        }
        let status: StatusTable = ["a", "b", "c", "d"]
            .iter()
            .map(|id| (id.to_string(), Stage::Idle))
            .collect();

        // c has no value, so c and everything above it is invalid
        let invalid = invalid_definitions(&active, &store, &status, &mut ParameterCache::new()).unwrap();
        let invalid_ids = ids(&invalid);
        assert_eq!(invalid_ids[0], "c");
        assert_eq!(invalid_ids.len(), 4);
        assert_eq!(*invalid_ids.last().unwrap(), "d");
    }

    #[test]
    fn test_non_idle_definitions_are_skipped() {
        let g = diamond();
        let active = vec![g.a.clone(), g.c.clone()];
        let mut status = StatusTable::new();
        status.insert("c".into(), Stage::Fetching);
        status.insert("a".into(), Stage::Waiting);

        let invalid =
            invalid_definitions(&active, &Store::new(), &status, &mut ParameterCache::new()).unwrap();
        assert!(invalid.is_empty());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let g = diamond();
        let active = vec![g.a.clone(), g.c.clone()];
        let mut store = Store::new();
        store.insert("sc".into(), json!(1));
        let mut status = StatusTable::new();
        status.insert("c".into(), Stage::Idle);
        status.insert("a".into(), Stage::Idle);

        let first = invalid_definitions(&active, &store, &status, &mut ParameterCache::new()).unwrap();
        let second = invalid_definitions(&active, &store, &status, &mut ParameterCache::new()).unwrap();
        assert_eq!(ids(&first), vec!["a"]);
        assert_eq!(ids(&first), ids(&second));
    }
}
