// src/lib.rs
//! Airgap Engine Library
//!
//! Blocks unintended network access from code running under test. Every
//! connection attempt and name resolution is intercepted and checked against
//! the configuration of the test currently running.
//!
//! # Architecture
//!
//! The library is structured into several key modules:
//!
//! - **policy**: host patterns and per-test allow/block configurations
//! - **context**: which configuration applies to the calling thread
//! - **engine**: allow/block decisions and exemptions
//! - **interception**: native (libc) and managed (resolver) hooks, engine bridge
//! - **lifecycle**: test annotations → active configuration
//! - **observability**: logging and decision counters
//! - **utils**: configuration loading and error types
//!
//! # Example
//!
//! ```no_run
//! use airgap_engine::{DecisionEngine, TestAnnotations, TestLifecycle};
//!
//! let lifecycle = TestLifecycle::global();
//! let _scope = lifecycle
//!     .scope(&TestAnnotations::blocking().with_allowed_hosts(["localhost"]))
//!     .unwrap();
//!
//! let engine = DecisionEngine::global();
//! assert!(engine.check("example.com", 443, "doc").is_err());
//! ```

pub mod context;
pub mod engine;
pub mod interception;
pub mod lifecycle;
pub mod observability;
pub mod policy;
pub mod utils;

// Re-export commonly used types
pub use context::ContextStore;
pub use engine::{Decision, DecisionEngine};
pub use interception::{ManagedHooks, NativeHookTable};
pub use lifecycle::{TestAnnotations, TestLifecycle, TestScope};
pub use policy::{Configuration, HostPattern};
pub use utils::config::AirgapConfig;
pub use utils::errors::{AirgapError, NetworkRequestAttempted, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Library build information
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
