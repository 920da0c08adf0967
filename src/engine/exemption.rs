// src/engine/exemption.rs
//! Exemptions for harness infrastructure traffic
//!
//! The harness may need the network (dependency resolution, artifact
//! downloads) while a test's configuration is active. Its destinations are
//! not known in advance, so the exemption is keyed on *who* is calling,
//! from the call stack or the thread identity, never on the host.
//!
//! Thread-identity exemption is inherently heuristic; embedders supply the
//! `ThreadClassifier` that fits their harness.

use crate::context::thread_identity::ThreadClassifier;
use crate::engine::call_stack::CallStack;
use std::sync::Arc;

/// Decides whether an attempt bypasses the allow/block check
pub trait ExemptionPredicate: Send + Sync {
    fn is_exempt(&self, stack: &CallStack) -> bool;
}

impl<F> ExemptionPredicate for F
where
    F: Fn(&CallStack) -> bool + Send + Sync,
{
    fn is_exempt(&self, stack: &CallStack) -> bool {
        self(stack)
    }
}

/// Never exempts anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExemption;

impl ExemptionPredicate for NoExemption {
    fn is_exempt(&self, _stack: &CallStack) -> bool {
        false
    }
}

/// Exempts attempts whose stack contains any configured marker
#[derive(Debug, Clone, Default)]
pub struct StackMarkerExemption {
    markers: Vec<String>,
}

impl StackMarkerExemption {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }
}

impl ExemptionPredicate for StackMarkerExemption {
    fn is_exempt(&self, stack: &CallStack) -> bool {
        // no markers: never touch the stack
        if self.markers.is_empty() {
            return false;
        }
        self.markers.iter().any(|marker| stack.contains(marker))
    }
}

/// Exempts attempts made on harness infrastructure threads
pub struct HarnessThreadExemption {
    classifier: Arc<dyn ThreadClassifier>,
}

impl HarnessThreadExemption {
    pub fn new(classifier: Arc<dyn ThreadClassifier>) -> Self {
        Self { classifier }
    }
}

impl ExemptionPredicate for HarnessThreadExemption {
    fn is_exempt(&self, _stack: &CallStack) -> bool {
        self.classifier
            .is_harness_infrastructure(&std::thread::current())
    }
}

/// Exempts when any inner predicate does
#[derive(Default)]
pub struct AnyExemption {
    predicates: Vec<Arc<dyn ExemptionPredicate>>,
}

impl AnyExemption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: Arc<dyn ExemptionPredicate>) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl ExemptionPredicate for AnyExemption {
    fn is_exempt(&self, stack: &CallStack) -> bool {
        self.predicates.iter().any(|p| p.is_exempt(stack))
    }
}
