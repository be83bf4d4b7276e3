//! Feature descriptors and instances.

use crate::core::{Config, ConfigValue};
use crate::errors::ContractViolation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Setup cache flags required by a feature, keyed by cache entry.
pub type CacheFlags = BTreeMap<String, Vec<String>>;

/// Components a feature can contribute configuration to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Model frontend (e.g. `tflite`).
    Frontend,
    /// Inference framework (e.g. `tvm`).
    Framework,
    /// Code-generating backend (e.g. `tvmaot`).
    Backend,
    /// Execution target (e.g. `etiss_pulpino`).
    Target,
}

impl ComponentKind {
    /// The order in which component contributions are merged.
    pub const ALL: [Self; 4] = [Self::Frontend, Self::Framework, Self::Backend, Self::Target];

    /// Returns the lower-case name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Framework => "framework",
            Self::Backend => "backend",
            Self::Target => "target",
        }
    }

    /// Returns the capability that allows contributing to this kind.
    #[must_use]
    pub const fn capability(self) -> Capability {
        match self {
            Self::Frontend => Capability::Frontend,
            Self::Framework => Capability::Framework,
            Self::Backend => Capability::Backend,
            Self::Target => Capability::Target,
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a feature is able to influence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Frontend configuration.
    Frontend,
    /// Framework configuration.
    Framework,
    /// Backend configuration.
    Backend,
    /// Target configuration.
    Target,
    /// Dependency setup (cache flags).
    Setup,
    /// Target software compilation.
    Compile,
}

impl Capability {
    /// Returns the component kind for component capabilities.
    #[must_use]
    pub const fn component_kind(self) -> Option<ComponentKind> {
        match self {
            Self::Frontend => Some(ComponentKind::Frontend),
            Self::Framework => Some(ComponentKind::Framework),
            Self::Backend => Some(ComponentKind::Backend),
            Self::Target => Some(ComponentKind::Target),
            Self::Setup | Self::Compile => None,
        }
    }
}

/// Builds the error returned when a feature does not support a component.
#[must_use]
pub fn incompatible(feature: &str, kind: ComponentKind, component: &str) -> ContractViolation {
    ContractViolation::IncompatibleFeature {
        feature: feature.to_string(),
        kind: kind.as_str().to_string(),
        component: component.to_string(),
    }
}

/// Describes a feature: its capabilities, options and contributions.
///
/// Contributions are pure functions of the feature options and the component
/// name. `options` always contains the resolved `enabled` flag plus the
/// descriptor defaults overridden by user configuration, with the feature
/// prefix stripped.
pub trait FeatureDescriptor: Send + Sync + fmt::Debug {
    /// Returns the unique feature name.
    fn name(&self) -> &'static str;

    /// Returns a one-line description.
    fn description(&self) -> &'static str;

    /// Returns the capability set.
    fn capabilities(&self) -> &'static [Capability];

    /// Returns default option values (without the feature prefix).
    fn defaults(&self) -> Config {
        Config::new()
    }

    /// Returns the option keys that must be supplied by the user.
    fn required(&self) -> &'static [&'static str] {
        &[]
    }

    /// Contribution for a frontend.
    fn frontend_config(&self, frontend: &str, _options: &Config) -> Result<Config, ContractViolation> {
        Err(incompatible(self.name(), ComponentKind::Frontend, frontend))
    }

    /// Contribution for a framework.
    fn framework_config(&self, framework: &str, _options: &Config) -> Result<Config, ContractViolation> {
        Err(incompatible(self.name(), ComponentKind::Framework, framework))
    }

    /// Contribution for a backend.
    fn backend_config(&self, backend: &str, _options: &Config) -> Result<Config, ContractViolation> {
        Err(incompatible(self.name(), ComponentKind::Backend, backend))
    }

    /// Contribution for a target.
    fn target_config(&self, target: &str, _options: &Config) -> Result<Config, ContractViolation> {
        Err(incompatible(self.name(), ComponentKind::Target, target))
    }

    /// Contribution to the compile step.
    ///
    /// Receives the configuration resolved so far so that list values can be
    /// extended instead of replaced.
    fn compile_config(&self, _options: &Config, _current: &Config) -> Config {
        Config::new()
    }

    /// Setup cache flags the feature depends on.
    fn cache_flags(&self, _options: &Config) -> CacheFlags {
        CacheFlags::new()
    }

    /// Dispatches to the contribution for `kind`.
    fn contribute(
        &self,
        kind: ComponentKind,
        component: &str,
        options: &Config,
    ) -> Result<Config, ContractViolation> {
        match kind {
            ComponentKind::Frontend => self.frontend_config(component, options),
            ComponentKind::Framework => self.framework_config(component, options),
            ComponentKind::Backend => self.backend_config(component, options),
            ComponentKind::Target => self.target_config(component, options),
        }
    }
}

/// A feature attached to a run: descriptor plus resolved options.
#[derive(Debug, Clone)]
pub struct Feature {
    descriptor: Arc<dyn FeatureDescriptor>,
    options: Config,
}

impl Feature {
    /// Creates a feature instance from a descriptor and resolved options.
    #[must_use]
    pub fn new(descriptor: Arc<dyn FeatureDescriptor>, options: Config) -> Self {
        Self { descriptor, options }
    }

    /// Returns the feature name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.descriptor.name()
    }

    /// Returns true unless the `enabled` option is false.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.options.get_bool("enabled").unwrap_or(true)
    }

    /// Returns the resolved options.
    #[must_use]
    pub fn options(&self) -> &Config {
        &self.options
    }

    /// Returns the descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<dyn FeatureDescriptor> {
        &self.descriptor
    }

    /// Returns true if the descriptor declares the capability.
    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.descriptor.capabilities().contains(&capability)
    }

    /// Requests the contribution for a component.
    pub fn contribute(&self, kind: ComponentKind, component: &str) -> Result<Config, ContractViolation> {
        self.descriptor.contribute(kind, component, &self.options)
    }

    /// Requests the compile contribution.
    #[must_use]
    pub fn compile_config(&self, current: &Config) -> Config {
        self.descriptor.compile_config(&self.options, current)
    }

    /// Requests the setup cache flags.
    #[must_use]
    pub fn cache_flags(&self) -> CacheFlags {
        self.descriptor.cache_flags(&self.options)
    }

    /// Sets or overrides an option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.options.insert(key, value);
        self
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct BackendOnly;

    impl FeatureDescriptor for BackendOnly {
        fn name(&self) -> &'static str {
            "backend_only"
        }

        fn description(&self) -> &'static str {
            "Test feature"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Backend]
        }

        fn backend_config(&self, backend: &str, options: &Config) -> Result<Config, ContractViolation> {
            let enabled = options.get_bool("enabled").unwrap_or(true);
            Ok(Config::new().with(format!("{backend}.flag"), enabled))
        }
    }

    #[test]
    fn test_contribute_dispatch() {
        let feature = Feature::new(Arc::new(BackendOnly), Config::new());
        let config = feature.contribute(ComponentKind::Backend, "tvmaot").unwrap();
        assert_eq!(config.get_bool("tvmaot.flag"), Some(true));
    }

    #[test]
    fn test_unsupported_kind_is_incompatible() {
        let feature = Feature::new(Arc::new(BackendOnly), Config::new());
        let err = feature.contribute(ComponentKind::Target, "spike").unwrap_err();
        assert_eq!(err, incompatible("backend_only", ComponentKind::Target, "spike"));
    }

    #[test]
    fn test_enabled_flag() {
        let feature = Feature::new(Arc::new(BackendOnly), Config::new());
        assert!(feature.enabled());
        let feature = feature.with_option("enabled", "off");
        assert!(!feature.enabled());
    }

    #[test]
    fn test_capability_mapping() {
        assert_eq!(Capability::Backend.component_kind(), Some(ComponentKind::Backend));
        assert_eq!(Capability::Compile.component_kind(), None);
        assert_eq!(ComponentKind::Target.capability(), Capability::Target);
    }
}
