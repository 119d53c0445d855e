//! Common utilities for docflow
//!
//! This crate provides shared functionality used across all docflow crates.

pub mod error;

pub use error::{DocFlowError, Result};
