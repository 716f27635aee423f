//! Column loaders and the loader registry.
//!
//! A loader is a pure function from a raw stored value (typically a file
//! path) to its realized value. Loaders are attached to table columns and
//! invoked once per cell on first access; the registry maps loader names
//! from the manifest to implementations and is constructed explicitly at
//! startup rather than living in process-global state.

use crate::value::Value;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::warn;

/// A pure `raw -> realized` function attached to a table column.
pub trait Loader: Send + Sync {
    fn load(&self, raw: &Value) -> Value;
}

impl<F> Loader for F
where
    F: Fn(&Value) -> Value + Send + Sync,
{
    fn load(&self, raw: &Value) -> Value {
        self(raw)
    }
}

/// Registry of named loaders, resolved by the manifest resolver.
///
/// Preserves registration order for introspection.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: IndexMap<String, Arc<dyn Loader>>,
}

impl LoaderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            loaders: IndexMap::new(),
        }
    }

    /// Create a registry with the built-in loaders registered.
    ///
    /// - `text`: read the file at the raw path into a string value.
    /// - `file_size`: the file's length in bytes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("text", text_loader);
        registry.register("file_size", file_size_loader);
        registry
    }

    /// Register a loader under a name. Re-registering a name replaces it.
    pub fn register(&mut self, name: impl Into<String>, loader: impl Loader + 'static) {
        self.loaders.insert(name.into(), Arc::new(loader));
    }

    /// Get a loader by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Loader>> {
        self.loaders.get(name).cloned()
    }

    /// Names of all registered loaders, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("loaders", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn text_loader(raw: &Value) -> Value {
    let Some(path) = raw.as_str() else {
        warn!("text loader expects a path string, got {:?}", raw.kind());
        return Value::Null;
    };
    match std::fs::read_to_string(path) {
        Ok(contents) => Value::Str(contents),
        Err(err) => {
            warn!("text loader failed to read {}: {}", path, err);
            Value::Null
        }
    }
}

fn file_size_loader(raw: &Value) -> Value {
    let Some(path) = raw.as_str() else {
        warn!("file_size loader expects a path string, got {:?}", raw.kind());
        return Value::Null;
    };
    match std::fs::metadata(path) {
        Ok(meta) => Value::Int(meta.len() as i64),
        Err(err) => {
            warn!("file_size loader failed to stat {}: {}", path, err);
            Value::Null
        }
    }
}
