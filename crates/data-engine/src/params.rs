//! Parameter building
//!
//! Computes, for a definition, the resolved view of its own store slot and
//! of its dependencies. This is what fetchers, fetcher keys, availability
//! predicates and consumers receive.
//!
//! Resolution is recursive: a dependency's value is produced by its own
//! `map_data` applied to its store slot and its own resolved dependencies.
//! Dependency names containing dots nest the result at that path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::definition::Definition;
use crate::types::{DefinitionId, Stage, StatusTable, Store};

/// Separator for nested dependency names
pub const PATH_SEPARATOR: char = '.';

/// A consumable value paired with its definition's stage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resolved {
    /// `None` when the value is undefined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub status: Stage,
}

/// One node of a resolved dependency tree
///
/// A node can carry its own entry and nested children at the same time,
/// e.g. `"user"` and `"user.avatar"` declared side by side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedNode {
    pub entry: Option<Resolved>,
    pub children: ResolvedTree,
}

impl ResolvedNode {
    fn to_value(&self) -> Value {
        let mut object = match self.children.to_value() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(entry) = &self.entry {
            object.insert("status".to_string(), serde_json::json!(entry.status));
            if let Some(value) = &entry.value {
                object.insert("value".to_string(), value.clone());
            }
        }
        Value::Object(object)
    }
}

/// Resolved dependencies keyed by name, mirroring the dotted-name hierarchy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedTree {
    nodes: BTreeMap<String, ResolvedNode>,
}

impl ResolvedTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an entry at a dotted path, creating intermediate nodes
    ///
    /// Sibling paths are left untouched.
    pub fn assign_path(&mut self, path: &str, resolved: Resolved) {
        let mut segments = path.split(PATH_SEPARATOR);
        let Some(first) = segments.next() else {
            return;
        };
        let mut node = self.nodes.entry(first.to_string()).or_default();
        for segment in segments {
            node = node.children.nodes.entry(segment.to_string()).or_default();
        }
        node.entry = Some(resolved);
    }

    /// Node at a dotted path
    pub fn node(&self, path: &str) -> Option<&ResolvedNode> {
        let mut segments = path.split(PATH_SEPARATOR);
        let mut node = self.nodes.get(segments.next()?)?;
        for segment in segments {
            node = node.children.nodes.get(segment)?;
        }
        Some(node)
    }

    /// Entry at a dotted path
    pub fn get(&self, path: &str) -> Option<&Resolved> {
        self.node(path).and_then(|node| node.entry.as_ref())
    }

    /// Value at a dotted path, `None` if absent or undefined
    pub fn value(&self, path: &str) -> Option<&Value> {
        self.get(path).and_then(|entry| entry.value.as_ref())
    }

    /// Stage at a dotted path
    pub fn status(&self, path: &str) -> Option<Stage> {
        self.get(path).map(|entry| entry.status)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of top-level names
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedNode)> {
        self.nodes.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// JSON view: `{ name: { status, value, ...children } }`
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.nodes
                .iter()
                .map(|(name, node)| (name.clone(), node.to_value()))
                .collect(),
        )
    }
}

impl Serialize for ResolvedTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Parameters before `map_parameters`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawParameters {
    /// The definition's own store slot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<Value>,
    /// The definition's own resolved value and stage
    pub data: Resolved,
    /// Resolved dependencies
    pub dependencies: ResolvedTree,
}

impl RawParameters {
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        if let Some(store) = &self.store {
            object.insert("store".to_string(), store.clone());
        }
        let mut data = Map::new();
        data.insert("status".to_string(), serde_json::json!(self.data.status));
        if let Some(value) = &self.data.value {
            data.insert("value".to_string(), value.clone());
        }
        object.insert("data".to_string(), Value::Object(data));
        object.insert("dependencies".to_string(), self.dependencies.to_value());
        Value::Object(object)
    }
}

/// Raw and mapped parameters for one definition
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub raw: RawParameters,
    pub mapped: Value,
}

/// Per-pass memo of built parameters keyed by definition id
///
/// Must not outlive the pass it was created for: store and status may
/// change between passes.
#[derive(Debug, Default)]
pub struct ParameterCache {
    entries: HashMap<DefinitionId, Arc<Parameters>>,
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve a named dependency list into a tree of values and stages
pub fn resolve(
    dependencies: &[(String, Definition)],
    store: &Store,
    status: &StatusTable,
) -> ResolvedTree {
    let mut tree = ResolvedTree::new();
    for (name, definition) in dependencies {
        tree.assign_path(name, resolve_definition(definition, store, status));
    }
    tree
}

/// Resolve a single definition's consumable value and stage
pub fn resolve_definition(definition: &Definition, store: &Store, status: &StatusTable) -> Resolved {
    let nested = resolve(&definition.dependencies(), store, status);
    Resolved {
        value: definition.map_data(store.get(definition.store_id()), &nested),
        status: status.get(definition.id()).copied().unwrap_or_default(),
    }
}

/// Build raw and mapped parameters for a definition
///
/// With a cache, the result is memoized by definition id for the rest of
/// the pass.
pub fn build_parameters(
    definition: &Definition,
    store: &Store,
    status: &StatusTable,
    cache: Option<&mut ParameterCache>,
) -> Arc<Parameters> {
    if let Some(cached) = cache
        .as_ref()
        .and_then(|cache| cache.entries.get(definition.id()))
    {
        return Arc::clone(cached);
    }

    let raw = RawParameters {
        store: store.get(definition.store_id()).cloned(),
        data: resolve_definition(definition, store, status),
        dependencies: resolve(&definition.dependencies(), store, status),
    };
    let mapped = definition.map_parameters(&raw);
    let parameters = Arc::new(Parameters { raw, mapped });

    if let Some(cache) = cache {
        cache
            .entries
            .insert(definition.id().to_string(), Arc::clone(&parameters));
    }
    parameters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DefinitionBuilder;
    use serde_json::json;

    fn fixture() -> (Definition, Definition, Definition) {
        let token = DefinitionBuilder::new().id("token").store_id("s-token").build();
        let user = DefinitionBuilder::new()
            .id("user")
            .store_id("s-user")
            .dependency("token", &token)
            .map_data(|input| {
                let name = input.store?.get("name")?.clone();
                let token = input.dependencies.value("token").cloned().unwrap_or_default();
                Some(json!({ "name": name, "token": token }))
            })
            .build();
        let posts = DefinitionBuilder::new()
            .id("posts")
            .store_id("s-posts")
            .dependency("auth.user", &user)
            .dependency("auth.token", &token)
            .build();
        (token, user, posts)
    }

    #[test]
    fn test_assign_path_nests_without_touching_siblings() {
        let mut tree = ResolvedTree::new();
        tree.assign_path("a", Resolved { value: Some(json!(1)), status: Stage::Idle });
        tree.assign_path("a.b", Resolved { value: Some(json!(2)), status: Stage::Waiting });
        tree.assign_path("c.d.e", Resolved { value: None, status: Stage::Fetching });

        assert_eq!(tree.value("a"), Some(&json!(1)));
        assert_eq!(tree.value("a.b"), Some(&json!(2)));
        assert_eq!(tree.status("c.d.e"), Some(Stage::Fetching));
        assert!(tree.get("c.d").is_none());
        assert!(tree.node("c.d").is_some());
        assert_eq!(tree.len(), 2);

        assert_eq!(
            tree.to_value(),
            json!({
                "a": { "status": "IDLE", "value": 1, "b": { "status": "WAITING", "value": 2 } },
                "c": { "d": { "e": { "status": "FETCHING" } } }
            })
        );
    }

    #[test]
    fn test_resolve_applies_map_data_recursively() {
        let (token, user, posts) = fixture();
        let mut store = Store::new();
        store.insert("s-token".into(), json!("t-1"));
        store.insert("s-user".into(), json!({ "name": "ada" }));
        let mut status = StatusTable::new();
        status.insert(token.id().into(), Stage::Idle);
        status.insert(user.id().into(), Stage::Idle);

        let tree = resolve(&posts.dependencies(), &store, &status);
        assert_eq!(tree.value("auth.user"), Some(&json!({ "name": "ada", "token": "t-1" })));
        assert_eq!(tree.value("auth.token"), Some(&json!("t-1")));
        assert_eq!(tree.status("auth.user"), Some(Stage::Idle));
    }

    #[test]
    fn test_missing_status_resolves_as_waiting() {
        let (_, user, _) = fixture();
        let resolved = resolve_definition(&user, &Store::new(), &StatusTable::new());
        assert_eq!(resolved.status, Stage::Waiting);
        assert_eq!(resolved.value, None);
    }

    #[test]
    fn test_build_parameters_raw_and_mapped() {
        let (token, _, _) = fixture();
        let mut store = Store::new();
        store.insert("s-token".into(), json!("t-9"));

        let params = build_parameters(&token, &store, &StatusTable::new(), None);
        assert_eq!(params.raw.store, Some(json!("t-9")));
        assert_eq!(params.raw.data.value, Some(json!("t-9")));
        assert!(params.raw.dependencies.is_empty());
        assert_eq!(
            params.mapped,
            json!({ "store": "t-9", "data": { "status": "WAITING", "value": "t-9" }, "dependencies": {} })
        );

        let paged = DefinitionBuilder::new()
            .id("paged")
            .map_parameters(|raw| json!({ "page": raw.store.clone().unwrap_or(json!(1)) }))
            .build();
        let params = build_parameters(&paged, &Store::new(), &StatusTable::new(), None);
        assert_eq!(params.mapped, json!({ "page": 1 }));
    }

    #[test]
    fn test_cache_memoizes_within_a_pass() {
        let (token, _, _) = fixture();
        let mut cache = ParameterCache::new();
        let mut store = Store::new();

        let first = build_parameters(&token, &store, &StatusTable::new(), Some(&mut cache));
        store.insert("s-token".into(), json!("changed"));
        let second = build_parameters(&token, &store, &StatusTable::new(), Some(&mut cache));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        let fresh = build_parameters(&token, &store, &StatusTable::new(), None);
        assert_eq!(fresh.raw.store, Some(json!("changed")));
    }
}
