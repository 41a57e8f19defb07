//! Operation descriptors
//!
//! Every call through the retry policy carries an [`Operation`]: its name,
//! whether it reads or writes, the arguments that identify it in the caches
//! and the queue, and the safe default returned when the datastore cannot be
//! reached. Descriptors are built explicitly at the call site or looked up in
//! an [`OperationCatalog`]; legacy name prefixes are only a fallback.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Read or write classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Read,
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Read => write!(f, "read"),
            OperationKind::Write => write!(f, "write"),
        }
    }
}

type DefaultFn<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;
type ValueFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Descriptor of a single datastore call
pub struct Operation<T> {
    name: String,
    kind: OperationKind,
    args: Value,
    cache_category: Option<String>,
    invalidates: Vec<String>,
    default: Option<DefaultFn<T>>,
}

impl<T> Operation<T> {
    pub fn new(name: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            args: Value::Null,
            cache_category: None,
            invalidates: Vec::new(),
            default: None,
        }
    }

    pub fn read(name: impl Into<String>) -> Self {
        Self::new(name, OperationKind::Read)
    }

    pub fn write(name: impl Into<String>) -> Self {
        Self::new(name, OperationKind::Write)
    }

    /// Arguments identifying this call in caches and the offline queue
    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Cache category for read results, instead of the policy's read category
    pub fn cache_in(mut self, category: impl Into<String>) -> Self {
        self.cache_category = Some(category.into());
        self
    }

    /// Categories a successful write makes stale
    pub fn invalidates<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates.extend(categories.into_iter().map(Into::into));
        self
    }

    /// Safe default produced on demand
    pub fn default_with<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_read(&self) -> bool {
        self.kind == OperationKind::Read
    }

    pub fn arguments(&self) -> &Value {
        &self.args
    }

    pub fn cache_category(&self) -> Option<&str> {
        self.cache_category.as_deref()
    }

    pub fn invalidated_categories(&self) -> &[String] {
        &self.invalidates
    }

    /// Declared safe default, if any
    pub fn declared_default(&self) -> Option<T> {
        self.default.as_ref().and_then(|f| f())
    }

    /// Cache key of this call within its category
    pub fn cache_key(&self) -> String {
        crate::cache::CacheKey::operation(&self.name, &self.args)
    }
}

impl<T: Clone + Send + Sync + 'static> Operation<T> {
    /// Fixed safe default
    pub fn default_value(self, value: T) -> Self {
        self.default_with(move || Some(value.clone()))
    }
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            args: self.args.clone(),
            cache_category: self.cache_category.clone(),
            invalidates: self.invalidates.clone(),
            default: self.default.clone(),
        }
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("args", &self.args)
            .field("cache_category", &self.cache_category)
            .field("invalidates", &self.invalidates)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

const LEGACY_READ_PREFIXES: [&str; 8] = [
    "get_", "list_", "find_", "search_", "count_", "obtener_", "buscar_", "contar_",
];

/// Classification by name prefix, for operations without an explicit entry
pub fn legacy_kind(name: &str) -> OperationKind {
    if LEGACY_READ_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
        OperationKind::Read
    } else {
        OperationKind::Write
    }
}

/// Safe default implied by a legacy read prefix
///
/// Listings and searches default to an empty list, counts to zero, and
/// single-row lookups to null. Writes have no implied default.
pub fn legacy_default(name: &str) -> Option<Value> {
    if name.starts_with("list_") || name.starts_with("search_") || name.starts_with("buscar_") {
        return Some(Value::Array(Vec::new()));
    }
    if name.starts_with("count_") || name.starts_with("contar_") {
        return Some(Value::from(0));
    }
    if name.starts_with("obtener_todos") || name.starts_with("obtener_todas") {
        return Some(Value::Array(Vec::new()));
    }
    if legacy_kind(name) == OperationKind::Read {
        return Some(Value::Null);
    }
    None
}

#[derive(Clone)]
struct CatalogEntry {
    kind: OperationKind,
    default: Option<ValueFn>,
    invalidates: Vec<String>,
}

/// Per-operation metadata table: name to kind, default and invalidations
#[derive(Clone, Default)]
pub struct OperationCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl OperationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation with a fixed default
    pub fn register(&mut self, name: impl Into<String>, kind: OperationKind, default: Option<Value>) -> &mut Self {
        let default = default.map(|value| Arc::new(move || value.clone()) as ValueFn);
        self.entries.insert(
            name.into(),
            CatalogEntry {
                kind,
                default,
                invalidates: Vec::new(),
            },
        );
        self
    }

    /// Register an operation whose default is computed per call
    pub fn register_with<F>(&mut self, name: impl Into<String>, kind: OperationKind, default: F) -> &mut Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.entries.insert(
            name.into(),
            CatalogEntry {
                kind,
                default: Some(Arc::new(default)),
                invalidates: Vec::new(),
            },
        );
        self
    }

    /// Declare the cache categories a registered write makes stale
    pub fn invalidates<I, S>(&mut self, name: &str, categories: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.invalidates.extend(categories.into_iter().map(Into::into));
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kind_of(&self, name: &str) -> OperationKind {
        match self.entries.get(name) {
            Some(entry) => entry.kind,
            None => legacy_kind(name),
        }
    }

    pub fn default_for(&self, name: &str) -> Option<Value> {
        match self.entries.get(name) {
            Some(entry) => entry.default.as_ref().map(|f| f()),
            None => legacy_default(name),
        }
    }

    /// Descriptor for a named operation, typed to the caller's result
    ///
    /// The catalog default is converted when the descriptor asks for it; a
    /// default that does not fit `T` is treated as absent.
    pub fn operation<T>(&self, name: &str, args: Value) -> Operation<T>
    where
        T: DeserializeOwned + 'static,
    {
        let mut operation = Operation::new(name, self.kind_of(name)).args(args);

        let default: Option<ValueFn> = match self.entries.get(name) {
            Some(entry) => {
                operation = operation.invalidates(entry.invalidates.iter().cloned());
                entry.default.clone()
            }
            None => legacy_default(name).map(|value| Arc::new(move || value.clone()) as ValueFn),
        };

        if let Some(default) = default {
            operation = operation.default_with(move || serde_json::from_value(default()).ok());
        }
        operation
    }
}

impl fmt::Debug for OperationCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("OperationCatalog").field("operations", &names).finish()
    }
}
