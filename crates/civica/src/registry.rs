//! Saga definitions and their registry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use civica_common::Error;

use crate::step::SagaStep;

/// A named, versioned, ordered list of steps
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    name: &'static str,
    version: u32,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaDefinition {
    /// New empty definition
    pub fn new(name: &'static str, version: u32) -> Self {
        Self {
            name,
            version,
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Definition name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Definition version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Ordered steps
    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }
}

/// Registry of saga definitions keyed by `(name, version)`.
///
/// Versions are monotonically increasing per name. Persisted saga instances
/// carry the version they started under, and recovery resolves that exact
/// version.
#[derive(Debug, Default)]
pub struct SagaRegistry {
    definitions: RwLock<HashMap<(&'static str, u32), Arc<SagaDefinition>>>,
    latest: RwLock<HashMap<&'static str, u32>>,
}

impl SagaRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. The version must be strictly greater than any
    /// version already registered under the same name.
    pub fn register(&self, definition: SagaDefinition) -> Result<(), Error> {
        let mut latest = self
            .latest
            .write()
            .map_err(|_| Error::Internal("registry lock poisoned".to_string()))?;

        if let Some(current) = latest.get(definition.name()) {
            if definition.version() <= *current {
                return Err(Error::Conflict(format!(
                    "saga `{}` version {} already registered at version {current}",
                    definition.name(),
                    definition.version(),
                )));
            }
        }

        latest.insert(definition.name(), definition.version());
        self.definitions
            .write()
            .map_err(|_| Error::Internal("registry lock poisoned".to_string()))?
            .insert(
                (definition.name(), definition.version()),
                Arc::new(definition),
            );

        Ok(())
    }

    /// Exact-version lookup, used by recovery
    pub fn get(&self, name: &str, version: u32) -> Result<Arc<SagaDefinition>, Error> {
        self.definitions
            .read()
            .ok()
            .and_then(|defs| {
                defs.iter()
                    .find(|((n, v), _)| *n == name && *v == version)
                    .map(|(_, def)| Arc::clone(def))
            })
            .ok_or_else(|| Error::UnknownDefinition(name.to_string(), version))
    }

    /// Latest registered version for a name, used for new executions
    pub fn latest(&self, name: &str) -> Result<Arc<SagaDefinition>, Error> {
        let version = self
            .latest
            .read()
            .ok()
            .and_then(|latest| latest.get(name).copied())
            .ok_or_else(|| Error::UnknownDefinition(name.to_string(), 0))?;

        self.get(name, version)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn versions_are_monotonic() {
        let registry = SagaRegistry::new();
        registry
            .register(SagaDefinition::new("create_record", 1))
            .unwrap();
        registry
            .register(SagaDefinition::new("create_record", 2))
            .unwrap();

        // Re-registering an old version is rejected
        assert!(registry
            .register(SagaDefinition::new("create_record", 2))
            .is_err());
        assert!(registry
            .register(SagaDefinition::new("create_record", 1))
            .is_err());

        assert_eq!(registry.latest("create_record").unwrap().version(), 2);
        assert_eq!(registry.get("create_record", 1).unwrap().version(), 1);
        assert!(registry.get("create_record", 3).is_err());
        assert!(registry.latest("publish_draft").is_err());
    }
}
