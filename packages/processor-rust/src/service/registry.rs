use std::any::type_name;
use std::sync::Arc;

use dashmap::DashMap;

use super::operation::ApiOperation;

// ---------------------------------------------------------------------------
// OperationFactory
// ---------------------------------------------------------------------------

/// Zero-argument constructor producing a fresh operation instance.
pub type OperationFactory = Arc<dyn Fn() -> Box<dyn ApiOperation> + Send + Sync>;

/// A registered operation type: its constructor and the concrete type name.
#[derive(Clone)]
pub struct RegistryEntry {
    pub type_name: &'static str,
    factory: OperationFactory,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl RegistryEntry {
    /// Build a new instance of the registered type.
    #[must_use]
    pub fn create(&self) -> Box<dyn ApiOperation> {
        (self.factory)()
    }
}

/// Errors from resolving an operation name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Maps wire-level operation names to constructors of concrete operation types.
///
/// Populated once during startup, then shared by reference with the pipeline.
/// Reads are lock-free per shard and safe under concurrent `create_instance`
/// callers; re-registering a name overwrites the previous entry.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl OperationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a constructor for `name`. Every call of `factory` must return
    /// a new, independent instance.
    pub fn register<T, F>(&self, name: impl Into<String>, factory: F)
    where
        T: ApiOperation + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let name = name.into();
        let entry = RegistryEntry {
            type_name: type_name::<T>(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn ApiOperation>),
        };
        if let Some(previous) = self.entries.insert(name.clone(), entry) {
            tracing::debug!(
                operation = %name,
                previous = previous.type_name,
                "operation type re-registered"
            );
        }
    }

    /// Register `T` under `name`, instantiated through `T::default()`.
    pub fn register_default<T>(&self, name: impl Into<String>)
    where
        T: ApiOperation + Default + 'static,
    {
        self.register(name, T::default);
    }

    /// Look up the entry registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create a fresh instance of the type registered under `name`.
    ///
    /// The shard lock is released before the constructor runs.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownOperationType` if `name` is not registered.
    pub fn create_instance(&self, name: &str) -> Result<Box<dyn ApiOperation>, RegistryError> {
        let entry = self
            .get(name)
            .ok_or_else(|| RegistryError::UnknownOperationType(name.to_string()))?;
        Ok(entry.create())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
