//! Name-to-factory registry of capabilities.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, warn};

use crate::capability::{Descriptor, Factory, Origin, build};
use crate::schema::ParameterSchema;

/// Longest name accepted by common function-calling APIs.
pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid capability name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

#[derive(Clone)]
struct Entry {
    factory: Factory,
    origin: Origin,
}

/// Catalog of every capability known to the process.
///
/// Reads share the lock; writes are serialized. Factories always run after
/// the lock is released.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide default registry.
    pub fn global() -> Arc<Registry> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Registry::new())))
    }

    /// Add a capability.
    ///
    /// Returns `Ok(false)` when the name is already taken; the existing entry
    /// stays in place.
    pub fn register(
        &self,
        name: impl Into<String>,
        origin: Origin,
        factory: Factory,
    ) -> Result<bool, RegistryError> {
        let name = name.into();
        validate_name(&name)?;

        let mut entries = self.write();
        if entries.contains_key(&name) {
            warn!(capability = %name, "capability already registered, keeping existing entry");
            return Ok(false);
        }

        entries.insert(name.clone(), Entry { factory, origin });
        debug!(capability = %name, %origin, "registered capability");
        Ok(true)
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.write().remove(name).is_some();
        if removed {
            debug!(capability = name, "unregistered capability");
        } else {
            warn!(capability = name, "unregister of unknown capability");
        }
        removed
    }

    /// Remove every entry whose name starts with `prefix`.
    pub fn unregister_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|name, _| !name.starts_with(prefix));
        let removed = before - entries.len();
        debug!(prefix, removed, "unregistered capabilities by prefix");
        removed
    }

    pub fn lookup(&self, name: &str) -> Option<Factory> {
        self.read().get(name).map(|entry| Arc::clone(&entry.factory))
    }

    pub fn origin(&self, name: &str) -> Option<Origin> {
        self.read().get(name).map(|entry| entry.origin)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// All names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_by_origin(&self, origin: Origin) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, entry)| entry.origin == origin)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Describe every entry by instantiating it once.
    ///
    /// Entries that fail to instantiate are reported with a placeholder
    /// description and an empty schema.
    pub fn describe_all(&self) -> BTreeMap<String, Descriptor> {
        let snapshot: Vec<(String, Entry)> = self
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        snapshot
            .into_iter()
            .map(|(name, entry)| {
                let descriptor = match build(&entry.factory) {
                    Ok(capability) => capability.descriptor(),
                    Err(e) => {
                        warn!(capability = %name, error = %e, "failed to instantiate for description");
                        Descriptor {
                            name: name.clone(),
                            description: "Unknown".to_string(),
                            parameter_schema: ParameterSchema::new(),
                            origin: entry.origin,
                        }
                    }
                };
                (name, descriptor)
            })
            .collect()
    }

    /// Whether a writer panicked while holding the lock.
    pub fn is_poisoned(&self) -> bool {
        self.entries.is_poisoned()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("names", &self.list()).finish()
    }
}

/// Check that `name` is usable as a function-calling identifier.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let invalid = |reason| RegistryError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid("only ASCII letters, digits, `_` and `-` are allowed"));
    }
    Ok(())
}
