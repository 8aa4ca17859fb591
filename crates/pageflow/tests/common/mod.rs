//! Shared test utilities for pageflow integration tests.
//!
//! This module provides:
//! - `PipelineHarness` running the full service against temp-dir databases
//! - Stub collaborators standing in for real extraction backends

pub mod harness;
pub mod stubs;

pub use harness::PipelineHarness;
pub use stubs::TextExtractor;
