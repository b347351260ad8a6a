//! Shared test infrastructure for pass-indexer-checker-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::fixtures;
//! ```

pub mod fixtures;
