//! Shared test utilities for ocrflow integration tests.
//!
//! This module provides:
//! - `TestHarness` for an isolated database and seeded documents
//! - `ScriptedEngine` whose per-page behavior is set by the test

pub mod engine;
pub mod harness;

// not every test binary scripts an engine
#[allow(unused_imports)]
pub use engine::{PageScript, ScriptedEngine};
pub use harness::TestHarness;
