// src/context/mod.rs
//! Execution context
//!
//! - **Store**: per-thread active configuration with generation invalidation
//! - **Thread identity**: pluggable harness-infrastructure thread detection

pub mod store;
pub mod thread_identity;

pub use store::{ContextSnapshot, ContextStore};
pub use thread_identity::{NoHarnessThreads, ThreadClassifier, ThreadNamePrefixes};
