//! Run builder with feature resolution.

use super::{Run, RunState, WorkingDir};
use crate::components::{Backend, Frontend, ModelRef, Platform, Target};
use crate::core::Config;
use crate::errors::Result;
use crate::feature::{Components, ConfigResolver, Feature};
use crate::report::Postprocess;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// A feature attached to a builder, resolved in attach order.
#[derive(Debug)]
enum Attached {
    Name(String),
    Instance(Feature),
}

/// Builder for runs.
///
/// Collaborators and features are attached first; [`RunBuilder::build`]
/// resolves the features against the collaborators and fixes the run's
/// configuration.
#[derive(Debug)]
pub struct RunBuilder {
    index: usize,
    session: Option<usize>,
    model: ModelRef,
    framework: Option<String>,
    frontend: Option<Arc<dyn Frontend>>,
    backend: Option<Box<dyn Backend>>,
    platform: Option<Arc<dyn Platform>>,
    target: Option<Arc<dyn Target>>,
    postprocesses: Vec<Arc<dyn Postprocess>>,
    features: Vec<Attached>,
    config: Config,
    parallelism: usize,
    working_dir: Option<PathBuf>,
}

impl RunBuilder {
    /// Creates a builder for the given model.
    #[must_use]
    pub fn new(model: ModelRef) -> Self {
        Self {
            index: 0,
            session: None,
            model,
            framework: None,
            frontend: None,
            backend: None,
            platform: None,
            target: None,
            postprocesses: Vec::new(),
            features: Vec::new(),
            config: Config::new(),
            parallelism: 1,
            working_dir: None,
        }
    }

    /// Sets the run index.
    #[must_use]
    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Sets the index of the owning session.
    #[must_use]
    pub fn session(mut self, session: usize) -> Self {
        self.session = Some(session);
        self
    }

    /// Sets the frontend.
    #[must_use]
    pub fn frontend(mut self, frontend: Arc<dyn Frontend>) -> Self {
        self.frontend = Some(frontend);
        self
    }

    /// Names the framework the backend belongs to (`tvm`, `tflm`).
    #[must_use]
    pub fn framework(mut self, name: impl Into<String>) -> Self {
        self.framework = Some(name.into());
        self
    }

    /// Sets the backend. The run owns the instance.
    #[must_use]
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the platform.
    #[must_use]
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Sets the target.
    #[must_use]
    pub fn target(mut self, target: Arc<dyn Target>) -> Self {
        self.target = Some(target);
        self
    }

    /// Appends a run post-process.
    #[must_use]
    pub fn postprocess(mut self, postprocess: Arc<dyn Postprocess>) -> Self {
        self.postprocesses.push(postprocess);
        self
    }

    /// Attaches a feature by name. It is looked up when the run is built.
    #[must_use]
    pub fn feature(mut self, name: impl Into<String>) -> Self {
        self.features.push(Attached::Name(name.into()));
        self
    }

    /// Attaches an already instantiated feature.
    #[must_use]
    pub fn feature_instance(mut self, feature: Feature) -> Self {
        self.features.push(Attached::Instance(feature));
        self
    }

    /// Merges user configuration into the base config.
    #[must_use]
    pub fn config(mut self, config: &Config) -> Self {
        self.config.merge(config);
        self
    }

    /// Sets the number of parallel compile jobs (at least one).
    #[must_use]
    pub fn parallelism(mut self, jobs: usize) -> Self {
        self.parallelism = jobs.max(1);
        self
    }

    /// Uses a fixed working directory instead of a temporary one.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Returns the component names derived from the attached collaborators.
    fn components(&self) -> Components {
        Components {
            frontend: self.frontend.as_ref().map(|f| f.name().to_string()),
            framework: self.framework.clone(),
            backend: self.backend.as_ref().map(|b| b.name().to_string()),
            target: self.target.as_ref().map(|t| t.name().to_string()),
        }
    }

    /// Resolves features and creates the run.
    ///
    /// # Errors
    ///
    /// Returns an error if a feature is unknown, lacks a required option or
    /// does not support one of the run's components, or if the working
    /// directory can not be created.
    pub fn build(self, resolver: &ConfigResolver) -> Result<Run> {
        let components = self.components();
        let features = self
            .features
            .into_iter()
            .map(|attached| match attached {
                Attached::Name(name) => resolver.registry().instantiate(&name, &self.config),
                Attached::Instance(feature) => Ok(feature),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let config = resolver.resolve(&self.config, &features, &components)?;
        let dir = WorkingDir::create(self.working_dir)?;
        let label = Run::make_label(self.session, self.index);

        debug!(
            run = %label,
            features = features.len(),
            keys = config.len(),
            dir = %dir.path().display(),
            "Created run"
        );

        Ok(Run {
            index: self.index,
            session: self.session,
            label,
            model: self.model,
            components,
            frontend: self.frontend,
            backend: AsyncMutex::new(self.backend),
            platform: self.platform,
            target: self.target,
            postprocesses: self.postprocesses,
            features,
            config,
            parallelism: self.parallelism,
            dir,
            active: AtomicBool::new(false),
            state: RwLock::new(RunState::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ContractViolation;
    use crate::feature::{Capability, FeatureDescriptor, FeatureRegistry};
    use crate::testing::fake_run;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug)]
    struct Fixed(&'static str, i64);

    impl FeatureDescriptor for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn description(&self) -> &'static str {
            "Fixed backend contribution"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Backend]
        }

        fn backend_config(&self, _backend: &str, _options: &Config) -> std::result::Result<Config, ContractViolation> {
            Ok(Config::new().with("x.a", self.1))
        }
    }

    fn resolver() -> ConfigResolver {
        let registry = FeatureRegistry::new()
            .with(Arc::new(Fixed("f1", 1)))
            .unwrap()
            .with(Arc::new(Fixed("f2", 2)))
            .unwrap();
        ConfigResolver::new(Arc::new(registry))
    }

    #[test]
    fn test_mixed_attachments_keep_attach_order() {
        let resolver = resolver();
        let f1 = resolver.registry().instantiate("f1", &Config::new()).unwrap();

        let run = fake_run("aww", 1)
            .feature("f2")
            .feature_instance(f1)
            .build(&resolver)
            .unwrap();

        let names: Vec<&str> = run.features().iter().map(Feature::name).collect();
        assert_eq!(names, vec!["f2", "f1"]);
        assert_eq!(run.config().get("x.a"), Some(&json!(1)));
    }

    #[test]
    fn test_named_feature_attached_last_wins() {
        let resolver = resolver();
        let f1 = resolver.registry().instantiate("f1", &Config::new()).unwrap();

        let run = fake_run("aww", 1)
            .feature_instance(f1)
            .feature("f2")
            .build(&resolver)
            .unwrap();

        assert_eq!(run.config().get("x.a"), Some(&json!(2)));
    }

    #[test]
    fn test_unknown_feature_name() {
        let result = fake_run("aww", 1).feature("f9").build(&resolver());
        assert!(result.is_err());
    }
}
