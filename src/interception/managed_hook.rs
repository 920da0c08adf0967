// src/interception/managed_hook.rs
//! Layer B: guarded name-resolution APIs
//!
//! Wrappers around the resolution APIs Rust code calls before any socket
//! exists. Each wrapper runs `ManagedHooks::prologue` and only then the
//! wrapped resolver:
//!
//! - `ManagedHooks::resolve`: `std::net::ToSocketAddrs`
//! - `GuardedResolver`: `hyper-util` legacy client resolver (`tower::Service<Name>`)
//! - `GuardedAsyncResolver`: `trust-dns-resolver` Tokio resolver
//!
//! The install switch is read on every call, so flipping it at any time
//! affects wrappers that already exist. Nothing here depends on load order.

use crate::interception::bridge::BridgeResolver;
use crate::utils::errors::{AirgapError, Result, NAME_RESOLUTION_PORT};
use futures::future::{self, BoxFuture, FutureExt};
use hyper_util::client::legacy::connect::dns::{GaiResolver, Name};
use hyper_util::client::legacy::connect::HttpConnector;
use once_cell::sync::Lazy;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, info};
use trust_dns_resolver::lookup_ip::LookupIp;
use trust_dns_resolver::TokioAsyncResolver;

/// Caller tag of `ManagedHooks::resolve`
pub const CALLER_STD_RESOLVE: &str = "std-resolve";

/// Caller tag of `GuardedResolver`
pub const CALLER_HYPER_RESOLVER: &str = "hyper-resolver";

/// Caller tag of `GuardedAsyncResolver`
pub const CALLER_TRUST_DNS: &str = "trust-dns";

static GLOBAL_HOOKS: Lazy<Arc<ManagedHooks>> =
    Lazy::new(|| Arc::new(ManagedHooks::new(BridgeResolver::Dynamic)));

/// Guarded resolution entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedEntryPoint {
    StdToSocketAddrs,
    HyperResolver,
    TrustDns,
}

impl ManagedEntryPoint {
    pub fn caller_tag(self) -> &'static str {
        match self {
            ManagedEntryPoint::StdToSocketAddrs => CALLER_STD_RESOLVE,
            ManagedEntryPoint::HyperResolver => CALLER_HYPER_RESOLVER,
            ManagedEntryPoint::TrustDns => CALLER_TRUST_DNS,
        }
    }
}

/// Install switch and engine lookup shared by every Layer B wrapper
#[derive(Debug)]
pub struct ManagedHooks {
    installed: AtomicBool,
    resolver: BridgeResolver,
}

impl ManagedHooks {
    /// Uninstalled hooks resolving their engine through `resolver`
    pub fn new(resolver: BridgeResolver) -> Self {
        Self {
            installed: AtomicBool::new(false),
            resolver,
        }
    }

    pub fn global() -> Arc<ManagedHooks> {
        Arc::clone(&GLOBAL_HOOKS)
    }

    /// Start guarding. Idempotent; takes effect on the next call of every wrapper.
    pub fn install(&self) {
        if !self.installed.swap(true, Ordering::SeqCst) {
            info!("Managed resolution hooks installed");
        }
    }

    pub fn uninstall(&self) {
        if self.installed.swap(false, Ordering::SeqCst) {
            info!("Managed resolution hooks uninstalled");
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Check run before the wrapped resolver. An empty host (loopback by
    /// convention) never reaches the engine.
    pub fn prologue(&self, entry: ManagedEntryPoint, host: &str) -> io::Result<()> {
        if host.is_empty() || !self.is_installed() {
            return Ok(());
        }
        let Some(engine) = self.resolver.resolve() else {
            return Ok(());
        };
        if !engine.has_active_configuration() {
            return Ok(());
        }

        debug!(host, caller = entry.caller_tag(), "Resolution intercepted");
        engine
            .check(host, NAME_RESOLUTION_PORT, entry.caller_tag())
            .map_err(io::Error::from)
    }

    /// Guarded `(host, port).to_socket_addrs()`
    pub fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        self.prologue(ManagedEntryPoint::StdToSocketAddrs, host)?;
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Resolver for the `hyper-util` legacy client, guarding every lookup
#[derive(Debug, Clone)]
pub struct GuardedResolver<R = GaiResolver> {
    inner: R,
    hooks: Arc<ManagedHooks>,
}

impl<R> GuardedResolver<R> {
    pub fn new(inner: R, hooks: Arc<ManagedHooks>) -> Self {
        Self { inner, hooks }
    }
}

impl GuardedResolver<GaiResolver> {
    /// System resolver guarded by the global hooks
    pub fn system() -> Self {
        Self::new(GaiResolver::new(), ManagedHooks::global())
    }
}

impl<R> Service<Name> for GuardedResolver<R>
where
    R: Service<Name, Error = io::Error>,
    R::Response: Send + 'static,
    R::Future: Send + 'static,
{
    type Response = R::Response;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<R::Response>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        // decided on the calling thread, where the test's context lives
        if let Err(blocked) = self
            .hooks
            .prologue(ManagedEntryPoint::HyperResolver, name.as_str())
        {
            return future::ready(Err(blocked)).boxed();
        }
        self.inner.call(name).boxed()
    }
}

/// `HttpConnector` whose lookups go through `GuardedResolver`
pub fn guarded_http_connector(hooks: Arc<ManagedHooks>) -> HttpConnector<GuardedResolver> {
    HttpConnector::new_with_resolver(GuardedResolver::new(GaiResolver::new(), hooks))
}

/// `trust-dns-resolver` async resolver guarding every lookup
#[derive(Clone)]
pub struct GuardedAsyncResolver {
    inner: TokioAsyncResolver,
    hooks: Arc<ManagedHooks>,
}

impl GuardedAsyncResolver {
    pub fn new(inner: TokioAsyncResolver, hooks: Arc<ManagedHooks>) -> Self {
        Self { inner, hooks }
    }

    /// System configuration (`/etc/resolv.conf`), guarded by the global hooks
    pub fn from_system_conf() -> Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            AirgapError::InterceptionFailed(format!(
                "Failed to read system resolver configuration: {}",
                e
            ))
        })?;
        Ok(Self::new(inner, ManagedHooks::global()))
    }

    pub fn inner(&self) -> &TokioAsyncResolver {
        &self.inner
    }

    /// Guarded `lookup_ip`. The decision is taken when this is called, not
    /// when the future is first polled.
    pub fn lookup_ip(&self, host: &str) -> impl Future<Output = io::Result<LookupIp>> + '_ {
        let verdict = self.hooks.prologue(ManagedEntryPoint::TrustDns, host);
        let host = host.to_string();
        async move {
            verdict?;
            self.inner
                .lookup_ip(host.as_str())
                .await
                .map_err(io::Error::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::store::ContextStore;
    use crate::engine::decision::DecisionEngine;
    use crate::policy::configuration::Configuration;
    use crate::utils::errors::blocked_request;
    use std::str::FromStr;
    use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};

    fn hooks_with(config: Option<Configuration>) -> Arc<ManagedHooks> {
        let store = Arc::new(ContextStore::new());
        if let Some(config) = config {
            store.set_configuration(config);
        }
        let engine = Arc::new(DecisionEngine::new(store));
        Arc::new(ManagedHooks::new(BridgeResolver::Fixed(engine)))
    }

    fn loopback_only() -> Configuration {
        Configuration::builder().allow("127.0.0.1").build().unwrap()
    }

    /// Answers every name with 127.0.0.1 without touching the network
    #[derive(Clone)]
    struct LoopbackResolver;

    impl Service<Name> for LoopbackResolver {
        type Response = std::vec::IntoIter<SocketAddr>;
        type Error = io::Error;
        type Future = future::Ready<io::Result<Self::Response>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _name: Name) -> Self::Future {
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            future::ready(Ok(vec![addr].into_iter()))
        }
    }

    #[test]
    fn test_switch_toggles_at_any_time() {
        let hooks = hooks_with(Some(Configuration::block_all()));
        assert!(!hooks.is_installed());
        assert!(hooks.prologue(ManagedEntryPoint::StdToSocketAddrs, "example.com").is_ok());

        hooks.install();
        hooks.install();
        assert!(hooks.is_installed());
        assert!(hooks.prologue(ManagedEntryPoint::StdToSocketAddrs, "example.com").is_err());

        hooks.uninstall();
        assert!(hooks.prologue(ManagedEntryPoint::StdToSocketAddrs, "example.com").is_ok());
    }

    #[test]
    fn test_empty_host_is_exempt() {
        let hooks = hooks_with(Some(Configuration::block_all()));
        hooks.install();
        assert!(hooks.prologue(ManagedEntryPoint::StdToSocketAddrs, "").is_ok());
    }

    #[test]
    fn test_prologue_error_carries_sentinel_port() {
        let hooks = hooks_with(Some(loopback_only()));
        hooks.install();

        let err = hooks
            .prologue(ManagedEntryPoint::HyperResolver, "example.com")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        let blocked = blocked_request(&err).unwrap();
        assert_eq!(blocked.host, "example.com");
        assert_eq!(blocked.port, NAME_RESOLUTION_PORT);
        assert_eq!(blocked.caller, CALLER_HYPER_RESOLVER);
    }

    #[test]
    fn test_std_resolve() {
        let hooks = hooks_with(Some(loopback_only()));
        hooks.install();

        let addrs = hooks.resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse::<SocketAddr>().unwrap()]);

        let err = hooks.resolve("example.com", 80).unwrap_err();
        assert_eq!(blocked_request(&err).unwrap().caller, CALLER_STD_RESOLVE);
    }

    #[test]
    fn test_no_configuration_passes_through() {
        let hooks = hooks_with(None);
        hooks.install();
        assert!(hooks.resolve("127.0.0.1", 80).is_ok());
    }

    #[tokio::test]
    async fn test_hyper_resolver_wrapper() {
        let hooks = hooks_with(Some(
            Configuration::builder().allow("api.internal").build().unwrap(),
        ));
        hooks.install();
        let mut resolver = GuardedResolver::new(LoopbackResolver, hooks);

        let addrs: Vec<SocketAddr> = resolver
            .call(Name::from_str("api.internal").unwrap())
            .await
            .unwrap()
            .collect();
        assert_eq!(addrs.len(), 1);

        let err = resolver
            .call(Name::from_str("example.com").unwrap())
            .await
            .unwrap_err();
        assert_eq!(blocked_request(&err).unwrap().host, "example.com");
    }

    #[test]
    fn test_guarded_http_connector_builds() {
        let hooks = hooks_with(None);
        let _connector = guarded_http_connector(hooks);
    }

    #[tokio::test]
    async fn test_trust_dns_wrapper() {
        let hooks = hooks_with(Some(loopback_only()));
        hooks.install();
        let inner = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let resolver = GuardedAsyncResolver::new(inner, hooks);

        // IP literals are answered without a query
        let lookup = resolver.lookup_ip("127.0.0.1").await.unwrap();
        assert_eq!(lookup.iter().count(), 1);

        let err = resolver.lookup_ip("example.com").await.unwrap_err();
        let blocked = blocked_request(&err).unwrap();
        assert_eq!(blocked.caller, CALLER_TRUST_DNS);
        assert_eq!(blocked.port, NAME_RESOLUTION_PORT);
    }
}
