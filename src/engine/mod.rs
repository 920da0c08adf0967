// src/engine/mod.rs
//! Allow/block decision engine
//!
//! - **Decision**: `DecisionEngine::decide` and the `Decision` verdict
//! - **Exemption**: call-stack and thread-identity bypass predicates
//! - **Call stack**: lazily captured backtraces and diagnostic snippets
//!
//! # Architecture
//!
//! ```text
//! Layer A (libc connect/getaddrinfo) ─┐
//!                                     ├─→ bridge ─→ DecisionEngine ─→ ContextStore
//! Layer B (resolver wrappers) ────────┘                 │
//!                                                       └─→ Configuration patterns
//! ```

pub mod call_stack;
pub mod decision;
pub mod exemption;

pub use call_stack::CallStack;
pub use decision::{BlockDetails, Decision, DecisionEngine};
pub use exemption::{
    AnyExemption, ExemptionPredicate, HarnessThreadExemption, NoExemption, StackMarkerExemption,
};
