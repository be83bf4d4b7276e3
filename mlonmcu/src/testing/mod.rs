//! Testing utilities for runs and sessions.
//!
//! This module provides:
//! - Scripted collaborators that never spawn processes
//! - A call log shared between a collaborator and the test inspecting it
//! - Run builder fixtures wired to the fake collaborators

mod fixtures;
mod mocks;

pub use fixtures::{failing_run, fake_run};
pub use mocks::{
    CallLog, FailingBackend, FakePlatform, FakeTarget, RecordingBackend, StaticFrontend,
};
