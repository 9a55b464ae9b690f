//! Shared types, config loading, and the crate-wide error enum for the
//! kraken-agent workspace.
//!
//! Nothing in this crate talks to the network or the filesystem beyond
//! `config::load_settings` reading the two settings files; it exists so
//! `kraken-agent-core` and the `kraken-agent` binary share one vocabulary.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
