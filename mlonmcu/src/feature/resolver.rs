//! Composition of run configuration from features.

use super::descriptor::{CacheFlags, Capability, ComponentKind, Feature};
use super::registry::FeatureRegistry;
use crate::core::Config;
use crate::errors::{ContractViolation, FeatureError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// The component names selected for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Components {
    /// Frontend name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<String>,
    /// Framework name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    /// Backend name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Target name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Components {
    /// Creates an empty selection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the frontend.
    #[must_use]
    pub fn with_frontend(mut self, name: impl Into<String>) -> Self {
        self.frontend = Some(name.into());
        self
    }

    /// Sets the framework.
    #[must_use]
    pub fn with_framework(mut self, name: impl Into<String>) -> Self {
        self.framework = Some(name.into());
        self
    }

    /// Sets the backend.
    #[must_use]
    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.backend = Some(name.into());
        self
    }

    /// Sets the target.
    #[must_use]
    pub fn with_target(mut self, name: impl Into<String>) -> Self {
        self.target = Some(name.into());
        self
    }

    /// Returns the component name for a kind.
    #[must_use]
    pub fn get(&self, kind: ComponentKind) -> Option<&str> {
        match kind {
            ComponentKind::Frontend => self.frontend.as_deref(),
            ComponentKind::Framework => self.framework.as_deref(),
            ComponentKind::Backend => self.backend.as_deref(),
            ComponentKind::Target => self.target.as_deref(),
        }
    }
}

/// Merges base configuration with feature contributions.
///
/// Holds the registry so feature names can be turned into instances; the
/// resolution itself only depends on its arguments.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    registry: Arc<FeatureRegistry>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(Arc::new(FeatureRegistry::with_builtin()))
    }
}

impl ConfigResolver {
    /// Creates a resolver over a registry.
    #[must_use]
    pub fn new(registry: Arc<FeatureRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<FeatureRegistry> {
        &self.registry
    }

    /// Instantiates named features with options taken from `user`.
    pub fn resolve_features<S: AsRef<str>>(
        &self,
        names: &[S],
        user: &Config,
    ) -> Result<Vec<Feature>, FeatureError> {
        names
            .iter()
            .map(|name| self.registry.instantiate(name.as_ref(), user))
            .collect()
    }

    /// Resolves the final configuration of a run.
    ///
    /// Features are applied in attach order after `base`. For each enabled
    /// feature the component contributions are merged in the order frontend,
    /// framework, backend, target (only for components that are present),
    /// followed by its compile contribution. Disabled features are skipped.
    pub fn resolve(
        &self,
        base: &Config,
        features: &[Feature],
        components: &Components,
    ) -> Result<Config, ContractViolation> {
        let mut config = base.clone();
        for feature in features {
            if !feature.enabled() {
                debug!(feature = feature.name(), "Skipping disabled feature");
                continue;
            }
            for kind in ComponentKind::ALL {
                if !feature.has_capability(kind.capability()) {
                    continue;
                }
                let Some(component) = components.get(kind) else {
                    continue;
                };
                let contribution = feature.contribute(kind, component)?;
                debug!(
                    feature = feature.name(),
                    kind = %kind,
                    component,
                    keys = contribution.len(),
                    "Merging feature contribution"
                );
                config.merge(&contribution);
            }
            if feature.has_capability(Capability::Compile) {
                let contribution = feature.compile_config(&config);
                config.merge(&contribution);
            }
        }
        Ok(config)
    }

    /// Collects the union of setup cache flags required by enabled features.
    #[must_use]
    pub fn cache_flags(&self, features: &[Feature]) -> CacheFlags {
        let mut flags = CacheFlags::new();
        for feature in features
            .iter()
            .filter(|f| f.enabled() && f.has_capability(Capability::Setup))
        {
            for (key, values) in feature.cache_flags() {
                let entry = flags.entry(key).or_default();
                for value in values {
                    if !entry.contains(&value) {
                        entry.push(value);
                    }
                }
            }
        }
        for values in flags.values_mut() {
            values.sort();
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{FeatureDescriptor, FeatureRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug)]
    struct Fixed(&'static str, Config);

    impl FeatureDescriptor for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn description(&self) -> &'static str {
            "Fixed contribution"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Backend]
        }

        fn backend_config(&self, _backend: &str, _options: &Config) -> Result<Config, ContractViolation> {
            Ok(self.1.clone())
        }
    }

    fn resolver() -> ConfigResolver {
        let registry = FeatureRegistry::new()
            .with(Arc::new(Fixed("f1", Config::new().with("x.a", 1))))
            .unwrap()
            .with(Arc::new(Fixed("f2", Config::new().with("x.a", 2).with("x.b", 3))))
            .unwrap();
        ConfigResolver::new(Arc::new(registry))
    }

    #[test]
    fn test_later_feature_wins() {
        let resolver = resolver();
        let features = resolver.resolve_features(&["f1", "f2"], &Config::new()).unwrap();
        let components = Components::new().with_backend("any");

        let config = resolver.resolve(&Config::new(), &features, &components).unwrap();

        assert_eq!(config.to_json(), json!({"x.a": 2, "x.b": 3}));
    }

    #[test]
    fn test_features_override_base() {
        let resolver = resolver();
        let features = resolver.resolve_features(&["f1"], &Config::new()).unwrap();
        let base = Config::new().with("x.a", 0).with("x.z", "base");

        let config = resolver
            .resolve(&base, &features, &Components::new().with_backend("any"))
            .unwrap();

        assert_eq!(config.to_json(), json!({"x.a": 1, "x.z": "base"}));
    }

    #[test]
    fn test_disabled_feature_contributes_nothing() {
        let resolver = ConfigResolver::default();
        let user = Config::new().with("unpacked_api.enabled", false);
        let features = resolver.resolve_features(&["unpacked_api"], &user).unwrap();

        let config = resolver
            .resolve(&Config::new(), &features, &Components::new().with_backend("tvmaot"))
            .unwrap();

        assert!(config.is_empty());
    }

    #[test]
    fn test_incompatible_component() {
        let resolver = ConfigResolver::default();
        let features = resolver.resolve_features(&["unpacked_api"], &Config::new()).unwrap();

        let err = resolver
            .resolve(&Config::new(), &features, &Components::new().with_backend("tflmi"))
            .unwrap_err();

        assert_eq!(
            err,
            ContractViolation::IncompatibleFeature {
                feature: "unpacked_api".into(),
                kind: "backend".into(),
                component: "tflmi".into(),
            }
        );
    }

    #[test]
    fn test_absent_component_is_skipped() {
        let resolver = ConfigResolver::default();
        let features = resolver.resolve_features(&["trace"], &Config::new()).unwrap();

        let config = resolver
            .resolve(&Config::new(), &features, &Components::new().with_backend("tvmaot"))
            .unwrap();

        assert!(config.is_empty());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = ConfigResolver::default();
        let user = Config::new()
            .with("muriscvnn.lib", "/opt/lib.a")
            .with("muriscvnn.inc_dir", "/opt/inc");
        let names = ["debug_arena", "muriscvnn", "debug"];
        let components = Components::new()
            .with_frontend("tflite")
            .with_framework("tflite")
            .with_backend("tvmaot")
            .with_target("etiss_pulpino");

        let first = resolver
            .resolve(&user, &resolver.resolve_features(&names, &user).unwrap(), &components)
            .unwrap();
        let second = resolver
            .resolve(&user, &resolver.resolve_features(&names, &user).unwrap(), &components)
            .unwrap();

        assert_eq!(first.to_canonical_json(), second.to_canonical_json());
        assert_eq!(first.get("mlif.tflite_micro_libs"), Some(&json!(["/opt/lib.a"])));
        assert_eq!(first.get_bool("mlif.debug"), Some(true));
    }

    #[test]
    fn test_cache_flags_union() {
        let resolver = ConfigResolver::default();
        let user = Config::new()
            .with("muriscvnn.lib", "/opt/lib.a")
            .with("muriscvnn.inc_dir", "/opt/inc");
        let features = resolver
            .resolve_features(&["packed", "muriscvnn", "etissdbg"], &user)
            .unwrap();

        let flags = resolver.cache_flags(&features);

        assert_eq!(
            flags.get("tflmc.exe"),
            Some(&vec!["muriscvnn".to_string(), "packed".to_string()])
        );
        assert_eq!(flags.get("etiss.install_dir"), Some(&vec!["debug".to_string()]));
    }
}
