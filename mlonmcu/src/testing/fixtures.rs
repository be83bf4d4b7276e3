//! Run builder fixtures.

use super::mocks::{FailingBackend, FakePlatform, FakeTarget, RecordingBackend, StaticFrontend};
use crate::components::ModelRef;
use crate::run::RunBuilder;
use std::sync::Arc;

/// Returns a builder for a run whose collaborators all succeed.
///
/// The target reports `cycles` cycles.
#[must_use]
pub fn fake_run(model: &str, cycles: u64) -> RunBuilder {
    RunBuilder::new(ModelRef::new(model))
        .frontend(Arc::new(StaticFrontend::new("tflite")))
        .framework("tvm")
        .backend(Box::new(RecordingBackend::new("tvmaot")))
        .platform(Arc::new(FakePlatform::new("mlif")))
        .target(Arc::new(FakeTarget::new("host_x86", cycles)))
}

/// Returns a builder for a run whose backend fails during BUILD.
#[must_use]
pub fn failing_run(model: &str) -> RunBuilder {
    fake_run(model, 0).backend(Box::new(FailingBackend::new("tvmaot", "code generation failed")))
}
