// src/engine/decision.rs
//! Decision engine
//!
//! Both interception layers funnel into `DecisionEngine`. The engine holds
//! no interception logic of its own and can be exercised directly.
//!
//! ```text
//! decide(host, port, caller)
//!   no active configuration     → Allow   (fail open)
//!   exemption predicate matches → Allow
//!   any blocked pattern matches → Block
//!   any allowed pattern matches → Allow
//!   otherwise                   → Block   (empty allow set allows nothing)
//! ```

use crate::context::store::ContextStore;
use crate::context::thread_identity::ThreadNamePrefixes;
use crate::engine::call_stack::CallStack;
use crate::engine::exemption::{
    AnyExemption, ExemptionPredicate, HarnessThreadExemption, NoExemption, StackMarkerExemption,
};
use crate::observability;
use crate::utils::config::{AirgapConfig, EngineSettings};
use crate::utils::errors::NetworkRequestAttempted;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

static GLOBAL_ENGINE: Lazy<Arc<DecisionEngine>> = Lazy::new(|| {
    Arc::new(DecisionEngine::from_settings(
        ContextStore::global(),
        &AirgapConfig::global().engine,
    ))
});

/// Details of a blocked attempt
pub type BlockDetails = NetworkRequestAttempted;

/// Per-call verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block(BlockDetails),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn is_blocked(&self) -> bool {
        !self.is_allowed()
    }

    /// `Ok` for `Allow`, the structured error for `Block`
    pub fn into_result(self) -> Result<(), NetworkRequestAttempted> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Block(details) => Err(details),
        }
    }
}

/// Allow/block decisions against a context store
pub struct DecisionEngine {
    /// Source of the active configuration
    store: Arc<ContextStore>,

    /// Harness infrastructure bypass
    exemption: Arc<dyn ExemptionPredicate>,

    /// Frames kept in a block's stack snippet
    stack_depth: usize,
}

impl DecisionEngine {
    /// Engine without exemptions
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self {
            store,
            exemption: Arc::new(NoExemption),
            stack_depth: EngineSettings::default().stack_snippet_depth,
        }
    }

    /// Engine configured from `[engine]` settings
    pub fn from_settings(store: Arc<ContextStore>, settings: &EngineSettings) -> Self {
        let mut exemption = AnyExemption::new();
        if !settings.exempt_stack_markers.is_empty() {
            exemption = exemption.with(Arc::new(StackMarkerExemption::new(
                settings.exempt_stack_markers.iter().cloned(),
            )));
        }
        if !settings.harness_thread_prefixes.is_empty() {
            exemption = exemption.with(Arc::new(HarnessThreadExemption::new(Arc::new(
                ThreadNamePrefixes::new(settings.harness_thread_prefixes.iter().cloned()),
            ))));
        }

        let engine = Self::new(store).with_stack_depth(settings.stack_snippet_depth);
        if exemption.is_empty() {
            engine
        } else {
            engine.with_exemption(Arc::new(exemption))
        }
    }

    /// Process-wide engine over the global store
    pub fn global() -> Arc<DecisionEngine> {
        Arc::clone(&GLOBAL_ENGINE)
    }

    pub fn with_exemption(mut self, exemption: Arc<dyn ExemptionPredicate>) -> Self {
        self.exemption = exemption;
        self
    }

    pub fn with_stack_depth(mut self, depth: usize) -> Self {
        self.stack_depth = depth.max(1);
        self
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Cheap probe used by hooks to skip argument extraction
    pub fn has_active_configuration(&self) -> bool {
        self.store.has_active_configuration()
    }

    /// Decide on an attempt to reach `host:port`
    pub fn decide(&self, host: &str, port: i32, caller: &str) -> Decision {
        self.decide_with_stack(host, port, caller, &CallStack::lazy())
    }

    /// Decide with a caller-supplied stack, e.g. one recorded by a foreign runtime
    pub fn decide_with_stack(
        &self,
        host: &str,
        port: i32,
        caller: &str,
        stack: &CallStack,
    ) -> Decision {
        let Some(config) = self.store.get_configuration() else {
            observability::record_decision("no_configuration", caller);
            return Decision::Allow;
        };

        if self.exemption.is_exempt(stack) {
            debug!(host, port, caller, "Exempt attempt allowed");
            observability::record_decision("exempt", caller);
            return Decision::Allow;
        }

        if config.is_explicitly_blocked(host) {
            return self.block(host, port, caller, stack);
        }

        if config.is_listed_as_allowed(host) {
            observability::record_decision("allowed", caller);
            return Decision::Allow;
        }

        self.block(host, port, caller, stack)
    }

    /// Decide on a connection to an address, with the hostnames it was
    /// resolved from when known.
    ///
    /// An explicit block on the IP or on any hostname wins. Otherwise the
    /// connection is allowed when the IP or any hostname is allowed.
    pub fn decide_connection(
        &self,
        ip: IpAddr,
        hostnames: &[&str],
        port: u16,
        caller: &str,
    ) -> Decision {
        let Some(config) = self.store.get_configuration() else {
            observability::record_decision("no_configuration", caller);
            return Decision::Allow;
        };

        let stack = CallStack::lazy();
        if self.exemption.is_exempt(&stack) {
            observability::record_decision("exempt", caller);
            return Decision::Allow;
        }

        let address = ip.to_string();
        let hostnames: Vec<&str> = hostnames
            .iter()
            .copied()
            .filter(|name| !name.is_empty() && *name != address)
            .collect();
        let port = i32::from(port);

        let blocked_name = hostnames
            .iter()
            .copied()
            .find(|name| config.is_explicitly_blocked(name));
        if blocked_name.is_some() || config.is_explicitly_blocked(&address) {
            let reported = blocked_name
                .or_else(|| hostnames.first().copied())
                .unwrap_or(&address);
            return self.block(reported, port, caller, &stack);
        }

        if config.is_listed_as_allowed(&address)
            || hostnames.iter().any(|name| config.is_listed_as_allowed(name))
        {
            observability::record_decision("allowed", caller);
            return Decision::Allow;
        }

        let reported = hostnames.first().copied().unwrap_or(&address);
        self.block(reported, port, caller, &stack)
    }

    /// `decide` as a `Result`
    pub fn check(
        &self,
        host: &str,
        port: i32,
        caller: &str,
    ) -> Result<(), NetworkRequestAttempted> {
        self.decide(host, port, caller).into_result()
    }

    /// True when an active configuration explicitly blocks `host`
    pub fn is_explicitly_blocked(&self, host: &str) -> bool {
        self.store
            .get_configuration()
            .map_or(false, |config| config.is_explicitly_blocked(host))
    }

    fn block(&self, host: &str, port: i32, caller: &str, stack: &CallStack) -> Decision {
        let snippet = stack.snippet(self.stack_depth);
        let details = NetworkRequestAttempted::new(host, port, caller, snippet);
        debug!(host, port, caller, "Network request blocked");
        observability::record_decision("blocked", caller);
        Decision::Block(details)
    }
}
