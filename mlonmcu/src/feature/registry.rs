//! Feature registry for looking up descriptors by name.

use super::builtin;
use super::descriptor::{Capability, Feature, FeatureDescriptor};
use crate::core::Config;
use crate::errors::FeatureError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Catalogue of feature descriptors.
///
/// Built once at start-up and shared read-only afterwards; there is no
/// process-wide instance.
#[derive(Debug, Default, Clone)]
pub struct FeatureRegistry {
    descriptors: BTreeMap<&'static str, Arc<dyn FeatureDescriptor>>,
}

impl FeatureRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in catalogue.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin::all() {
            registry.descriptors.insert(descriptor.name(), descriptor);
        }
        registry
    }

    /// Registers a descriptor. Names must be unique.
    pub fn register(&mut self, descriptor: Arc<dyn FeatureDescriptor>) -> Result<(), FeatureError> {
        let name = descriptor.name();
        if self.descriptors.contains_key(name) {
            return Err(FeatureError::Duplicate(name.to_string()));
        }
        self.descriptors.insert(name, descriptor);
        Ok(())
    }

    /// Builder-style variant of [`FeatureRegistry::register`].
    pub fn with(mut self, descriptor: Arc<dyn FeatureDescriptor>) -> Result<Self, FeatureError> {
        self.register(descriptor)?;
        Ok(self)
    }

    /// Gets a descriptor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn FeatureDescriptor>> {
        self.descriptors.get(name)
    }

    /// Checks if a feature is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Lists all registered names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.keys().copied().collect()
    }

    /// Lists the names of features declaring a capability.
    #[must_use]
    pub fn names_with(&self, capability: Capability) -> Vec<&'static str> {
        self.descriptors
            .values()
            .filter(|descriptor| descriptor.capabilities().contains(&capability))
            .map(|descriptor| descriptor.name())
            .collect()
    }

    /// Returns the number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Instantiates a feature.
    ///
    /// Options start from `enabled = true` and the descriptor defaults, then
    /// take every `<name>.<option>` key of `user` with the prefix stripped.
    pub fn instantiate(&self, name: &str, user: &Config) -> Result<Feature, FeatureError> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| FeatureError::Unknown(name.to_string()))?;

        let mut options = Config::new().with("enabled", true);
        options.merge(&descriptor.defaults());
        options.merge(&user.scoped(name));

        if let Some(missing) = descriptor
            .required()
            .iter()
            .find(|key| !matches!(options.get(key), Some(value) if !value.is_null()))
        {
            return Err(FeatureError::MissingOption {
                feature: name.to_string(),
                option: format!("{name}.{missing}"),
            });
        }

        Ok(Feature::new(Arc::clone(descriptor), options))
    }
}
