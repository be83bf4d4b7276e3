//! Features and configuration resolution.
//!
//! A feature is a named descriptor with a capability set. Attaching a feature
//! to a run lets it contribute configuration to the run's frontend,
//! framework, backend and target, to the compile step, and to the setup of
//! dependencies.

pub mod builtin;
mod descriptor;
mod registry;
mod resolver;

pub use descriptor::{
    incompatible, CacheFlags, Capability, ComponentKind, Feature, FeatureDescriptor,
};
pub use registry::FeatureRegistry;
pub use resolver::{Components, ConfigResolver};
