// =============================================================================
// Provider registry — pluggable backends keyed by lowercase name
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::info;

use super::{Capabilities, ProviderBackend};

/// Registry of provider backends. Selection precedence when resolving a
/// backend: explicit argument > configured default > registry default (the
/// first registration).
pub struct ProviderRegistry {
    backends: RwLock<HashMap<String, Arc<dyn ProviderBackend>>>,
    registry_default: RwLock<Option<String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            registry_default: RwLock::new(None),
        }
    }

    /// Register a backend under its lowercase name. The first registration
    /// becomes the registry default.
    pub fn register(&self, backend: Arc<dyn ProviderBackend>) {
        let name = backend.name().to_lowercase();
        let caps = backend.capabilities();
        info!(
            provider = %name,
            quotes = caps.quotes,
            options = caps.options,
            expiries = caps.expiries,
            "provider registered"
        );

        let mut backends = self.backends.write();
        backends.insert(name.clone(), backend);

        let mut default = self.registry_default.write();
        if default.is_none() {
            *default = Some(name);
        }
    }

    /// Resolve a backend by precedence: `explicit` > `configured` > registry
    /// default.
    pub fn select(
        &self,
        explicit: Option<&str>,
        configured: Option<&str>,
    ) -> Result<Arc<dyn ProviderBackend>> {
        let backends = self.backends.read();
        let name = explicit
            .map(str::to_lowercase)
            .or_else(|| configured.map(str::to_lowercase))
            .or_else(|| self.registry_default.read().clone())
            .context("no provider backends registered")?;

        backends
            .get(&name)
            .cloned()
            .with_context(|| format!("provider '{name}' not registered"))
    }

    /// Capability flags per registered provider, for diagnostics.
    pub fn capabilities(&self) -> HashMap<String, Capabilities> {
        self.backends
            .read()
            .iter()
            .map(|(name, backend)| (name.clone(), backend.capabilities()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::sim::SimBackend;

    #[test]
    fn selection_precedence() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(SimBackend::named("alpha")));
        registry.register(Arc::new(SimBackend::named("beta")));

        // Registry default is the first registration.
        assert_eq!(registry.select(None, None).unwrap().name(), "alpha");
        // Configured default beats the registry default.
        assert_eq!(registry.select(None, Some("beta")).unwrap().name(), "beta");
        // Explicit beats both; case-insensitive.
        assert_eq!(
            registry.select(Some("ALPHA"), Some("beta")).unwrap().name(),
            "alpha"
        );
    }

    #[test]
    fn unknown_provider_errors() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(SimBackend::named("alpha")));
        assert!(registry.select(Some("gamma"), None).is_err());
    }

    #[test]
    fn empty_registry_errors() {
        let registry = ProviderRegistry::new();
        assert!(registry.select(None, None).is_err());
    }
}
