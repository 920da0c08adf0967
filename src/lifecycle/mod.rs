// src/lifecycle/mod.rs
//! Test lifecycle adapter
//!
//! Turns a test's network annotations plus the global defaults into the
//! active configuration, and clears it when the test ends.

pub mod adapter;

pub use adapter::{TestAnnotations, TestLifecycle, TestScope};
