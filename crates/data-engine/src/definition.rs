//! Data definitions and their fluent builder
//!
//! A `Definition` is an immutable descriptor of one fetchable or derivable
//! unit of data: where it lives in the store, what it depends on, how to
//! fetch it and when its current store content counts as available.
//!
//! Definitions are plain data. Whether a definition can fetch is an optional
//! field checked by the stage machine, not a separate type.
//!
//! # Example
//!
//! ```ignore
//! let user = DefinitionBuilder::new()
//!     .id("user")
//!     .fetch_with(|_mapped, _raw| async { Ok(serde_json::json!({ "name": "ada" })) })
//!     .build();
//!
//! let posts = DefinitionBuilder::new()
//!     .id("posts")
//!     .dependency("user", &user)
//!     .fetcher_key(|_mapped, raw| raw.dependencies.value("user").cloned().unwrap_or_default())
//!     .fetch_with(|_mapped, raw| async move { load_posts(raw).await })
//!     .build();
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::fetcher::{CallbackFetcher, Fetcher};
use crate::params::{Parameters, RawParameters, ResolvedTree};
use crate::types::{DefinitionId, StoreId};

/// Named dependencies of a definition, in declaration order
pub type DependencyList = Vec<(String, Definition)>;

/// Availability predicate: `(mapped, raw) -> bool`
pub type AvailabilityFn = Arc<dyn Fn(&Value, &RawParameters) -> bool + Send + Sync>;

/// Fetcher key: `(mapped, raw) -> signature`
pub type FetcherKeyFn = Arc<dyn Fn(&Value, &RawParameters) -> Value + Send + Sync>;

/// Parameter mapping applied before parameters reach the fetcher and predicates
pub type MapParametersFn = Arc<dyn Fn(&RawParameters) -> Value + Send + Sync>;

/// Transforms a definition's store slot into the value consumers see
pub type MapDataFn = Arc<dyn Fn(MapDataInput<'_>) -> Option<Value> + Send + Sync>;

/// Transforms a successful fetch payload before it is stored: `(payload, mapped, raw)`
pub type MapResponseFn = Arc<dyn Fn(Value, &Value, &RawParameters) -> Value + Send + Sync>;

/// Input handed to a `map_data` function
#[derive(Debug, Clone, Copy)]
pub struct MapDataInput<'a> {
    /// The definition's own store slot
    pub store: Option<&'a Value>,
    /// The definition's resolved dependencies
    pub dependencies: &'a ResolvedTree,
}

/// Dependencies as declared on a definition
///
/// The deferred form is evaluated on every access, which lets definitions
/// reference descriptors that are declared later.
#[derive(Clone, Default)]
pub enum Dependencies {
    #[default]
    None,
    Static(DependencyList),
    Deferred(Arc<dyn Fn() -> DependencyList + Send + Sync>),
}

impl Dependencies {
    /// Materialize the named dependency list
    pub fn resolve(&self) -> DependencyList {
        match self {
            Dependencies::None => Vec::new(),
            Dependencies::Static(list) => list.clone(),
            Dependencies::Deferred(factory) => factory(),
        }
    }
}

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next value of the process-wide id sequence
fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Default)]
struct DefinitionData {
    id: Option<DefinitionId>,
    store_id: Option<StoreId>,
    dependencies: Dependencies,
    fetcher: Option<Arc<dyn Fetcher>>,
    fetcher_key: Option<FetcherKeyFn>,
    is_data_available: Option<AvailabilityFn>,
    map_parameters: Option<MapParametersFn>,
    map_data: Option<MapDataFn>,
    map_fetcher_response: Option<MapResponseFn>,
}

/// Immutable data definition
///
/// Cloning is cheap; clones share the same descriptor.
#[derive(Clone)]
pub struct Definition {
    id: DefinitionId,
    store_id: StoreId,
    data: Arc<DefinitionData>,
}

impl Definition {
    /// Unique id of this definition
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store slot this definition writes into
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Named direct dependencies
    pub fn dependencies(&self) -> DependencyList {
        self.data.dependencies.resolve()
    }

    /// Whether the definition declares any dependency
    pub fn has_dependencies(&self) -> bool {
        match &self.data.dependencies {
            Dependencies::None => false,
            Dependencies::Static(list) => !list.is_empty(),
            Dependencies::Deferred(_) => !self.dependencies().is_empty(),
        }
    }

    /// The fetch operation, if any
    pub fn fetcher(&self) -> Option<&Arc<dyn Fetcher>> {
        self.data.fetcher.as_ref()
    }

    pub fn has_fetcher(&self) -> bool {
        self.data.fetcher.is_some()
    }

    pub fn has_fetcher_key(&self) -> bool {
        self.data.fetcher_key.is_some()
    }

    /// Compute the fetcher key, `None` when no key function is declared
    pub fn fetcher_key(&self, params: &Parameters) -> Option<Value> {
        self.data
            .fetcher_key
            .as_ref()
            .map(|key| key(&params.mapped, &params.raw))
    }

    /// Evaluate the availability predicate
    ///
    /// Without a custom predicate, data is available when the definition's
    /// own resolved value is defined.
    pub fn is_data_available(&self, params: &Parameters) -> bool {
        match &self.data.is_data_available {
            Some(predicate) => predicate(&params.mapped, &params.raw),
            None => params.raw.data.value.is_some(),
        }
    }

    /// Apply `map_parameters`, or expose the raw parameters as JSON
    pub fn map_parameters(&self, raw: &RawParameters) -> Value {
        match &self.data.map_parameters {
            Some(map) => map(raw),
            None => raw.to_value(),
        }
    }

    /// Produce the consumable value from the store slot and resolved dependencies
    pub fn map_data(&self, store: Option<&Value>, dependencies: &ResolvedTree) -> Option<Value> {
        match &self.data.map_data {
            Some(map) => map(MapDataInput {
                store,
                dependencies,
            }),
            None => store.cloned(),
        }
    }

    /// Apply `map_fetcher_response` to a successful payload
    pub fn map_fetcher_response(&self, payload: Value, params: &Parameters) -> Value {
        match &self.data.map_fetcher_response {
            Some(map) => map(payload, &params.mapped, &params.raw),
            None => payload,
        }
    }

    /// Whether two handles point at the same descriptor
    pub fn same_descriptor(&self, other: &Definition) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.data, &other.data)
    }

    /// Start a named variant of this definition
    ///
    /// The variant shares every field with the base (including the store
    /// slot) and gets the id `<base id>::<name>`. Any field can then be
    /// overridden on the returned builder.
    pub fn variant(&self, name: &str) -> DefinitionBuilder {
        let mut data = (*self.data).clone();
        data.id = Some(format!("{}::{}", self.id, name));
        data.store_id = Some(self.store_id.clone());
        DefinitionBuilder { data }
    }
}

impl PartialEq for Definition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Definition {}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("id", &self.id)
            .field("store_id", &self.store_id)
            .field("has_fetcher", &self.has_fetcher())
            .finish()
    }
}

/// Fluent builder for definitions
#[derive(Clone, Default)]
pub struct DefinitionBuilder {
    data: DefinitionData,
}

impl DefinitionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a stable id (generated from a sequence when omitted)
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.data.id = Some(id.into());
        self
    }

    /// Set the store slot (generated from a sequence when omitted)
    pub fn store_id(mut self, store_id: impl Into<String>) -> Self {
        self.data.store_id = Some(store_id.into());
        self
    }

    /// Add a named dependency
    ///
    /// A dotted name such as `"user.profile"` nests the resolved value at
    /// that path for consumers.
    pub fn dependency(mut self, name: impl Into<String>, definition: &Definition) -> Self {
        let mut list = match self.data.dependencies {
            Dependencies::Static(list) => list,
            Dependencies::None | Dependencies::Deferred(_) => Vec::new(),
        };
        list.push((name.into(), definition.clone()));
        self.data.dependencies = Dependencies::Static(list);
        self
    }

    /// Declare dependencies through a closure evaluated on access
    ///
    /// The closure must hand back the same `Definition` handles on every
    /// call (clones of definitions built once). A freshly built definition
    /// reusing an id is a different descriptor, and registering it again
    /// fails with `DuplicateDefinitionId`.
    pub fn dependencies_with(
        mut self,
        factory: impl Fn() -> DependencyList + Send + Sync + 'static,
    ) -> Self {
        self.data.dependencies = Dependencies::Deferred(Arc::new(factory));
        self
    }

    /// Attach a fetcher
    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.data.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Attach an async closure as the fetcher
    pub fn fetch_with<F, Fut>(self, callback: F) -> Self
    where
        F: Fn(Value, RawParameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.fetcher(CallbackFetcher::new(callback))
    }

    /// Remove the fetcher (useful on variants)
    pub fn without_fetcher(mut self) -> Self {
        self.data.fetcher = None;
        self
    }

    pub fn fetcher_key(
        mut self,
        key: impl Fn(&Value, &RawParameters) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.data.fetcher_key = Some(Arc::new(key));
        self
    }

    pub fn is_data_available(
        mut self,
        predicate: impl Fn(&Value, &RawParameters) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.data.is_data_available = Some(Arc::new(predicate));
        self
    }

    pub fn map_parameters(
        mut self,
        map: impl Fn(&RawParameters) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.data.map_parameters = Some(Arc::new(map));
        self
    }

    pub fn map_data(
        mut self,
        map: impl Fn(MapDataInput<'_>) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.data.map_data = Some(Arc::new(map));
        self
    }

    pub fn map_fetcher_response(
        mut self,
        map: impl Fn(Value, &Value, &RawParameters) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.data.map_fetcher_response = Some(Arc::new(map));
        self
    }

    /// Finish the definition
    pub fn build(self) -> Definition {
        let sequence = next_sequence();
        let id = self
            .data
            .id
            .clone()
            .unwrap_or_else(|| format!("definition-{}", sequence));
        let store_id = self
            .data
            .store_id
            .clone()
            .unwrap_or_else(|| format!("store-{}", sequence));
        Definition {
            id,
            store_id,
            data: Arc::new(self.data),
        }
    }
}

/// A base definition together with its named variants
#[derive(Debug, Clone)]
pub struct DefinitionSet {
    base: Definition,
    variants: Vec<(String, Definition)>,
}

impl DefinitionSet {
    pub fn new(base: Definition) -> Self {
        Self {
            base,
            variants: Vec::new(),
        }
    }

    /// Add a variant, overriding fields through `configure`
    pub fn with_variant(
        mut self,
        name: impl Into<String>,
        configure: impl FnOnce(DefinitionBuilder) -> DefinitionBuilder,
    ) -> Self {
        let name = name.into();
        let variant = configure(self.base.variant(&name)).build();
        self.variants.push((name, variant));
        self
    }

    pub fn base(&self) -> &Definition {
        &self.base
    }

    /// Look up a variant by name
    pub fn variant(&self, name: &str) -> Option<&Definition> {
        self.variants
            .iter()
            .find(|(variant_name, _)| variant_name == name)
            .map(|(_, definition)| definition)
    }

    pub fn variants(&self) -> impl Iterator<Item = (&str, &Definition)> {
        self.variants.iter().map(|(name, def)| (name.as_str(), def))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Resolved;
    use crate::types::Stage;

    fn params_with_value(value: Option<Value>) -> Parameters {
        let raw = RawParameters {
            store: value.clone(),
            data: Resolved {
                value,
                status: Stage::Idle,
            },
            dependencies: ResolvedTree::default(),
        };
        Parameters {
            mapped: raw.to_value(),
            raw,
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = DefinitionBuilder::new().build();
        let b = DefinitionBuilder::new().build();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.store_id(), b.store_id());
        assert!(a.id().starts_with("definition-"));
        assert!(a.store_id().starts_with("store-"));
    }

    #[test]
    fn test_default_availability_checks_own_value() {
        let def = DefinitionBuilder::new().id("a").build();
        assert!(!def.is_data_available(&params_with_value(None)));
        assert!(def.is_data_available(&params_with_value(Some(Value::Null))));
    }

    #[test]
    fn test_custom_availability_and_key() {
        let def = DefinitionBuilder::new()
            .id("a")
            .is_data_available(|_mapped, raw| {
                raw.store.as_ref().and_then(|v| v.as_u64()).unwrap_or(0) > 10
            })
            .fetcher_key(|_mapped, raw| raw.store.clone().unwrap_or_default())
            .build();

        let params = params_with_value(Some(serde_json::json!(3)));
        assert!(!def.is_data_available(&params));
        assert_eq!(def.fetcher_key(&params), Some(serde_json::json!(3)));
        assert!(!def.has_fetcher());
    }

    #[test]
    fn test_dependencies_keep_declaration_order() {
        let a = DefinitionBuilder::new().id("a").build();
        let b = DefinitionBuilder::new().id("b").build();
        let c = DefinitionBuilder::new()
            .id("c")
            .dependency("second", &b)
            .dependency("first", &a)
            .build();

        let names: Vec<String> = c.dependencies().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["second", "first"]);
        assert!(c.has_dependencies());
        assert!(!a.has_dependencies());
    }

    #[test]
    fn test_deferred_dependencies() {
        let a = DefinitionBuilder::new().id("a").build();
        let captured = a.clone();
        let b = DefinitionBuilder::new()
            .id("b")
            .dependencies_with(move || vec![("a".to_string(), captured.clone())])
            .build();

        let deps = b.dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].1, a);
    }

    #[test]
    fn test_variants_share_store_and_override_fields() {
        let base = DefinitionBuilder::new()
            .id("list")
            .store_id("list-store")
            .fetch_with(|_m, _r| async { Ok(Value::Null) })
            .build();

        let set = DefinitionSet::new(base.clone())
            .with_variant("first", |b| {
                b.map_data(|input| input.store.and_then(|v| v.get(0)).cloned())
            })
            .with_variant("manual", |b| b.without_fetcher());

        let first = set.variant("first").unwrap();
        assert_eq!(first.id(), "list::first");
        assert_eq!(first.store_id(), "list-store");
        assert!(first.has_fetcher());
        assert!(!first.same_descriptor(&base));

        let manual = set.variant("manual").unwrap();
        assert!(!manual.has_fetcher());
        assert!(set.variant("missing").is_none());
        assert_eq!(set.variants().count(), 2);

        let mapped = first.map_data(Some(&serde_json::json!([7, 8])), &ResolvedTree::default());
        assert_eq!(mapped, Some(serde_json::json!(7)));
    }
}
