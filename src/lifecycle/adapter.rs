// src/lifecycle/adapter.rs
//! Per-test activation
//!
//! ```text
//! allow_network_requests                        → no configuration
//! block_network_requests || apply_to_all_tests  → defaults ∪ annotations
//! otherwise                                     → no configuration
//! ```
//!
//! One test at a time per store: `before_test` and `after_test` are the only
//! writers and must not interleave across tests sharing a store.

use crate::context::store::ContextStore;
use crate::engine::decision::DecisionEngine;
use crate::interception::bridge;
use crate::interception::managed_hook::ManagedHooks;
use crate::policy::configuration::Configuration;
use crate::utils::config::{AirgapConfig, GlobalDefaults};
use crate::utils::errors::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

static GLOBAL_LIFECYCLE: Lazy<TestLifecycle> = Lazy::new(|| {
    let engine = DecisionEngine::global();
    bridge::register(engine.clone());
    ManagedHooks::global().install();
    TestLifecycle::new(Arc::clone(engine.store()), AirgapConfig::global().defaults.clone())
});

/// Network annotations of one test
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestAnnotations {
    /// Guard this test
    pub block_network_requests: bool,

    /// Opt this test out, overriding everything else
    pub allow_network_requests: bool,

    pub allowed_hosts: Vec<String>,

    pub blocked_hosts: Vec<String>,
}

impl TestAnnotations {
    /// Guarded test with no extra patterns
    pub fn blocking() -> Self {
        Self {
            block_network_requests: true,
            ..Self::default()
        }
    }

    /// Test opted out of guarding
    pub fn allowing() -> Self {
        Self {
            allow_network_requests: true,
            ..Self::default()
        }
    }

    pub fn with_allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts.extend(hosts.into_iter().map(Into::into));
        self
    }

    pub fn with_blocked_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_hosts.extend(hosts.into_iter().map(Into::into));
        self
    }
}

/// Sets and clears the active configuration around each test
pub struct TestLifecycle {
    store: Arc<ContextStore>,
    defaults: GlobalDefaults,
}

impl TestLifecycle {
    pub fn new(store: Arc<ContextStore>, defaults: GlobalDefaults) -> Self {
        Self { store, defaults }
    }

    /// Lifecycle over the global store. First use registers the global engine
    /// with the bridge and installs the global managed hooks.
    pub fn global() -> &'static TestLifecycle {
        &GLOBAL_LIFECYCLE
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn defaults(&self) -> &GlobalDefaults {
        &self.defaults
    }

    /// Configuration a test with `annotations` runs under, if any
    pub fn resolve_configuration(
        &self,
        annotations: &TestAnnotations,
    ) -> Result<Option<Configuration>> {
        if annotations.allow_network_requests {
            return Ok(None);
        }
        if !annotations.block_network_requests && !self.defaults.apply_to_all_tests {
            return Ok(None);
        }

        let defaults = Configuration::builder()
            .allow_hosts(&self.defaults.allowed_hosts)
            .block_hosts(&self.defaults.blocked_hosts)
            .build()?;
        let annotated = Configuration::builder()
            .allow_hosts(&annotations.allowed_hosts)
            .block_hosts(&annotations.blocked_hosts)
            .build()?;
        Ok(Some(defaults.merge(&annotated)))
    }

    /// Activate the test's configuration on the current thread and as the
    /// store's fallback
    pub fn before_test(&self, annotations: &TestAnnotations) -> Result<Option<Arc<Configuration>>> {
        let Some(config) = self.resolve_configuration(annotations)? else {
            debug!("Test runs without network guarding");
            return Ok(None);
        };

        Ok(Some(self.store.set_configuration(config)))
    }

    /// Deactivate, invalidating every copy of the configuration
    pub fn after_test(&self) {
        self.store.clear_configuration();
    }

    /// `before_test` now, `after_test` when the guard drops (unwinding included)
    pub fn scope(&self, annotations: &TestAnnotations) -> Result<TestScope<'_>> {
        let configuration = self.before_test(annotations)?;
        Ok(TestScope {
            lifecycle: self,
            configuration,
        })
    }
}

/// Active test; clears the configuration on drop
pub struct TestScope<'a> {
    lifecycle: &'a TestLifecycle,
    configuration: Option<Arc<Configuration>>,
}

impl TestScope<'_> {
    pub fn configuration(&self) -> Option<&Arc<Configuration>> {
        self.configuration.as_ref()
    }

    pub fn is_guarded(&self) -> bool {
        self.configuration.is_some()
    }
}

impl Drop for TestScope<'_> {
    fn drop(&mut self) {
        self.lifecycle.after_test();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decision::DecisionEngine;
    use crate::policy::pattern::HostPattern;
    use std::panic::{self, AssertUnwindSafe};

    fn lifecycle(defaults: GlobalDefaults) -> TestLifecycle {
        TestLifecycle::new(Arc::new(ContextStore::new()), defaults)
    }

    fn defaults(apply_to_all_tests: bool) -> GlobalDefaults {
        GlobalDefaults {
            apply_to_all_tests,
            allowed_hosts: vec!["localhost".to_string()],
            blocked_hosts: vec!["*.tracking.com".to_string()],
        }
    }

    #[test]
    fn test_unannotated_test_is_not_guarded() {
        let lifecycle = lifecycle(defaults(false));
        assert!(lifecycle.before_test(&TestAnnotations::default()).unwrap().is_none());
        assert!(!lifecycle.store().has_active_configuration());
    }

    #[test]
    fn test_apply_to_all_tests_guards_unannotated_test() {
        let lifecycle = lifecycle(defaults(true));
        let active = lifecycle.before_test(&TestAnnotations::default()).unwrap().unwrap();
        assert!(active.is_listed_as_allowed("localhost"));
        assert!(active.is_explicitly_blocked("ads.tracking.com"));
    }

    #[test]
    fn test_allow_annotation_wins() {
        let lifecycle = lifecycle(defaults(true));
        let mut annotations = TestAnnotations::blocking();
        annotations.allow_network_requests = true;
        assert!(lifecycle.before_test(&annotations).unwrap().is_none());
    }

    #[test]
    fn test_annotations_merge_over_defaults() {
        let lifecycle = lifecycle(defaults(false));
        let annotations = TestAnnotations::blocking()
            .with_allowed_hosts(["api.internal", "localhost"])
            .with_blocked_hosts(["evil.com"]);

        let active = lifecycle.before_test(&annotations).unwrap().unwrap();
        assert_eq!(
            active.allowed_patterns(),
            &[
                HostPattern::parse("localhost").unwrap(),
                HostPattern::parse("api.internal").unwrap()
            ]
        );
        assert_eq!(active.blocked_patterns().len(), 2);
    }

    #[test]
    fn test_resolved_configuration_is_union_of_defaults_and_annotations() {
        let lifecycle = lifecycle(defaults(false));
        let annotations = TestAnnotations::blocking()
            .with_allowed_hosts(["LOCALHOST", "api.internal"])
            .with_blocked_hosts(["*.tracking.com"]);

        let resolved = lifecycle.resolve_configuration(&annotations).unwrap().unwrap();
        let expected = Configuration::builder()
            .allow("localhost")
            .block("*.tracking.com")
            .build()
            .unwrap()
            .merge(&Configuration::builder().allow("api.internal").build().unwrap());

        assert_eq!(resolved, expected);
        assert_eq!(resolved.allowed_patterns().len(), 2);
        assert_eq!(resolved.blocked_patterns().len(), 1);
    }

    #[test]
    fn test_invalid_annotation_pattern_is_an_error() {
        let lifecycle = lifecycle(GlobalDefaults::default());
        let annotations = TestAnnotations::blocking().with_allowed_hosts(["http://example.com/"]);
        assert!(lifecycle.before_test(&annotations).is_err());
        assert!(!lifecycle.store().has_active_configuration());
    }

    #[test]
    fn test_scope_drives_engine_decisions() {
        let lifecycle = lifecycle(GlobalDefaults::default());
        let engine = DecisionEngine::new(Arc::clone(lifecycle.store()));

        {
            let scope = lifecycle
                .scope(&TestAnnotations::blocking().with_allowed_hosts(["localhost"]))
                .unwrap();
            assert!(scope.is_guarded());
            assert!(engine.decide("localhost", 80, "test").is_allowed());
            assert!(engine.decide("example.com", 80, "test").is_blocked());
        }

        assert!(engine.decide("example.com", 80, "test").is_allowed());
    }

    #[test]
    fn test_scope_clears_on_panic() {
        let lifecycle = lifecycle(GlobalDefaults::default());
        let before = lifecycle.store().generation();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _scope = lifecycle.scope(&TestAnnotations::blocking()).unwrap();
            panic!("test body failed");
        }));

        assert!(result.is_err());
        assert!(!lifecycle.store().has_active_configuration());
        assert!(lifecycle.store().generation() > before);
    }

    #[test]
    fn test_annotations_deserialize() {
        let annotations: TestAnnotations =
            serde_json::from_str(r#"{"block_network_requests":true,"allowed_hosts":["localhost"]}"#)
                .unwrap();
        assert_eq!(
            annotations,
            TestAnnotations::blocking().with_allowed_hosts(["localhost"])
        );
    }
}
