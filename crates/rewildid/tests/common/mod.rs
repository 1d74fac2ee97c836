//! Shared test utilities for rewildid integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated test execution with temp directories
//! - A scripted stand-in for the external detection/ReID pipeline
//! - Helpers for waiting on asynchronous job transitions

pub mod harness;
pub mod pipeline;

pub use harness::{wait_for, wait_for_terminal, TestHarness};
pub use pipeline::FakePipeline;
