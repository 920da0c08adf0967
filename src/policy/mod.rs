// src/policy/mod.rs
//! Allow/block policy model
//!
//! - **Pattern**: literal, `*` and `*.suffix` host patterns
//! - **Configuration**: immutable allow/block pattern sets for one test

pub mod configuration;
pub mod pattern;

pub use configuration::{Configuration, ConfigurationBuilder};
pub use pattern::{matches, HostPattern};
