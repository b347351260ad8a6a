//! pass-indexer-checker-core: Core library for the PASS indexer checker
//!
//! This crate provides the check logic behind `pass-indexer-checker`, a
//! smoke test confirming that writes to the PASS repository propagate to the
//! Elasticsearch index.
//!
//! # Architecture
//!
//! ```text
//! system.toml + PASS_* env → Config → App
//!                                      ↓
//!              IndexClient ← Checker → PassRepository (Fedora, lookups via index)
//!                                      ↓ on failure
//!                                  Notifier (SMTP)
//! ```
//!
//! # Modules
//!
//! - `config`: Settings file and environment overrides
//! - `error`: Error types and remediation guidance
//! - `logging`: Tracing subscriber setup
//! - `wait`: Bounded, cancellable polling
//! - `index`: Elasticsearch mapping and search access
//! - `repository`: PASS resources and the Fedora-backed repository
//! - `notify`: Failure e-mail
//! - `check`: The check sequence
//! - `app`: Wiring from options to a finished run
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod app;
pub mod check;
pub mod config;
pub mod error;
pub mod index;
pub mod logging;
pub mod notify;
pub mod repository;
pub mod wait;

pub use error::{Error, Result};
