// src/interception/native_hook.rs
//! Layer A: native connect and name-resolution hooks
//!
//! Every connection and every lookup in the process ends in libc `connect(2)`
//! or `getaddrinfo(3)`. The preload shim interposes both and routes them
//! through a `NativeHookTable`.
//!
//! # Bind order
//!
//! An entry point is hookable only if the hook table is installed before the
//! entry point is first bound (its original resolved). One bound earlier,
//! e.g. by another library's constructor, stays unhookable and passes through
//! for the rest of the process. Layer B covers that gap.
//!
//! ```text
//!             install()            bind(entry)
//! Unbound ───────────────────────────────────→ Hooked
//!    │
//!    └── bind(entry) before install() ───────→ Unhookable (permanent)
//! ```

use crate::interception::bridge::BridgeResolver;
use crate::observability;
use crate::utils::config::{AirgapConfig, NativeSettings};
use crate::utils::errors::{AirgapError, NetworkRequestAttempted, Result, NAME_RESOLUTION_PORT};
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use std::cell::Cell;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Caller tag of the connect hook
pub const CALLER_NATIVE_CONNECT: &str = "native-connect";

/// Caller tag of the name-resolution hook
pub const CALLER_NATIVE_DNS: &str = "native-dns";

/// Name of the shared library built with `--features preload`
#[cfg(target_os = "macos")]
pub const PRELOAD_LIBRARY_NAME: &str = "libairgap_engine.dylib";
#[cfg(not(target_os = "macos"))]
pub const PRELOAD_LIBRARY_NAME: &str = "libairgap_engine.so";

const ADDRESS_BOOK_CAPACITY: usize = 16_384;

/// Hostnames remembered per address, most recent first
const HOSTNAMES_PER_ADDRESS: usize = 8;

static GLOBAL_TABLE: Lazy<NativeHookTable> = Lazy::new(|| {
    NativeHookTable::new(BridgeResolver::Dynamic).with_debug(AirgapConfig::global().native.debug)
});

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Native entry points interposed by the shim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeEntryPoint {
    Connect,
    GetAddrInfo,
}

impl NativeEntryPoint {
    pub const ALL: [NativeEntryPoint; 2] =
        [NativeEntryPoint::Connect, NativeEntryPoint::GetAddrInfo];

    /// libc symbol name
    pub fn symbol(self) -> &'static str {
        match self {
            NativeEntryPoint::Connect => "connect",
            NativeEntryPoint::GetAddrInfo => "getaddrinfo",
        }
    }

    pub fn caller_tag(self) -> &'static str {
        match self {
            NativeEntryPoint::Connect => CALLER_NATIVE_CONNECT,
            NativeEntryPoint::GetAddrInfo => CALLER_NATIVE_DNS,
        }
    }

    fn index(self) -> usize {
        match self {
            NativeEntryPoint::Connect => 0,
            NativeEntryPoint::GetAddrInfo => 1,
        }
    }
}

/// Hook state of one entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BindState {
    Unbound = 0,
    Hooked = 1,
    Unhookable = 2,
}

impl BindState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BindState::Hooked,
            2 => BindState::Unhookable,
            _ => BindState::Unbound,
        }
    }
}

/// Entry point states at the moment `install()` ran
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Not bound yet; hooked on first bind
    pub pending: Vec<NativeEntryPoint>,

    /// Bound before installation, never hooked
    pub unhookable: Vec<NativeEntryPoint>,
}

impl InstallReport {
    /// True when every entry point can still be hooked
    pub fn is_complete(&self) -> bool {
        self.unhookable.is_empty()
    }
}

/// IP → hostnames observed by the name-resolution hook, so the connect hook
/// can evaluate the hostnames a connection was resolved from.
///
/// Several hosts can share one address (CDNs, virtual hosting). All of them
/// are kept, up to `HOSTNAMES_PER_ADDRESS`, and the decision sees every one.
#[derive(Debug, Default)]
pub struct AddressBook {
    entries: DashMap<IpAddr, Vec<String>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `host` resolved to `addresses`. IP literals are skipped.
    pub fn record<I>(&self, host: &str, addresses: I)
    where
        I: IntoIterator<Item = IpAddr>,
    {
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return;
        }
        if self.entries.len() >= ADDRESS_BOOK_CAPACITY {
            self.entries.clear();
        }
        for address in addresses {
            let mut names = self.entries.entry(address.to_canonical()).or_default();
            names.retain(|name| !name.eq_ignore_ascii_case(host));
            names.insert(0, host.to_string());
            names.truncate(HOSTNAMES_PER_ADDRESS);
        }
    }

    /// Hostnames `address` was resolved from, most recent first
    pub fn hostnames_for(&self, address: IpAddr) -> Vec<String> {
        self.entries
            .get(&address.to_canonical())
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Marks the current thread as inside a hook. Nested hook calls on the same
/// thread pass straight through.
struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> Option<Self> {
        IN_HOOK
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(ReentrancyGuard)
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

/// Bind state and original addresses of the native entry points
pub struct NativeHookTable {
    installed: OnceCell<InstallReport>,
    states: [AtomicU8; 2],
    originals: [AtomicUsize; 2],
    resolver: BridgeResolver,
    addresses: AddressBook,
    debug: bool,
}

impl NativeHookTable {
    pub fn new(resolver: BridgeResolver) -> Self {
        Self {
            installed: OnceCell::new(),
            states: [
                AtomicU8::new(BindState::Unbound as u8),
                AtomicU8::new(BindState::Unbound as u8),
            ],
            originals: [AtomicUsize::new(0), AtomicUsize::new(0)],
            resolver,
            addresses: AddressBook::new(),
            debug: false,
        }
    }

    /// Per-call hook traces at `debug` level
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Table used by the preload shim
    pub fn global() -> &'static NativeHookTable {
        &GLOBAL_TABLE
    }

    /// Enable hooking for every entry point not bound yet. Idempotent: later
    /// calls return the first report.
    pub fn install(&self) -> &InstallReport {
        self.installed.get_or_init(|| {
            let mut report = InstallReport::default();
            for entry in NativeEntryPoint::ALL {
                match self.bind_state(entry) {
                    BindState::Unbound => report.pending.push(entry),
                    BindState::Hooked | BindState::Unhookable => report.unhookable.push(entry),
                }
            }

            for entry in &report.unhookable {
                warn!(
                    "{} was bound before hook installation and will not be intercepted",
                    entry.symbol()
                );
            }
            info!("Native hooks installed ({} pending bind)", report.pending.len());
            report
        })
    }

    pub fn is_installed(&self) -> bool {
        self.installed.get().is_some()
    }

    /// Record the first resolution of `entry` to `original`. Returns the
    /// resulting state; later binds keep the first one.
    pub fn bind(&self, entry: NativeEntryPoint, original: usize) -> BindState {
        let target = if self.is_installed() {
            BindState::Hooked
        } else {
            BindState::Unhookable
        };

        let slot = &self.states[entry.index()];
        match slot.compare_exchange(
            BindState::Unbound as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.originals[entry.index()].store(original, Ordering::Release);
                debug!("{} bound as {:?}", entry.symbol(), target);
                target
            }
            Err(existing) => BindState::from_u8(existing),
        }
    }

    pub fn bind_state(&self, entry: NativeEntryPoint) -> BindState {
        BindState::from_u8(self.states[entry.index()].load(Ordering::Acquire))
    }

    /// Original function address, once bound
    pub fn original(&self, entry: NativeEntryPoint) -> Option<usize> {
        match self.originals[entry.index()].load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    /// Hook body of `connect`: `Err` means the caller must fail the call
    pub fn guard_connect(
        &self,
        target: &SocketAddr,
        caller: &str,
    ) -> std::result::Result<(), NetworkRequestAttempted> {
        if !self.is_hooked(NativeEntryPoint::Connect) {
            return Ok(());
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return Ok(());
        };
        let Some(engine) = self.resolver.resolve() else {
            observability::record_passthrough(NativeEntryPoint::Connect.symbol(), "no_engine");
            return Ok(());
        };
        if !engine.has_active_configuration() {
            return Ok(());
        }

        let ip = target.ip().to_canonical();
        let recorded = self.addresses.hostnames_for(ip);
        let hostnames: Vec<&str> = recorded.iter().map(String::as_str).collect();
        if self.debug {
            debug!(%ip, ?hostnames, port = target.port(), caller, "connect intercepted");
        }
        engine.check_connection(ip, &hostnames, target.port(), caller)
    }

    /// Hook body of `getaddrinfo`: `Err` means the caller must fail the call
    pub fn guard_lookup(
        &self,
        host: &str,
        caller: &str,
    ) -> std::result::Result<(), NetworkRequestAttempted> {
        if host.is_empty() || !self.is_hooked(NativeEntryPoint::GetAddrInfo) {
            return Ok(());
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return Ok(());
        };
        let Some(engine) = self.resolver.resolve() else {
            observability::record_passthrough(NativeEntryPoint::GetAddrInfo.symbol(), "no_engine");
            return Ok(());
        };
        if !engine.has_active_configuration() {
            return Ok(());
        }

        if self.debug {
            debug!(host, caller, "name resolution intercepted");
        }
        engine.check(host, NAME_RESOLUTION_PORT, caller)
    }

    fn is_hooked(&self, entry: NativeEntryPoint) -> bool {
        match self.bind_state(entry) {
            BindState::Hooked => true,
            BindState::Unhookable => {
                observability::record_passthrough(entry.symbol(), "unhookable");
                false
            }
            BindState::Unbound => false,
        }
    }
}

/// Locate the preload shim: the configured path, else a standard location
pub fn preload_library(settings: &NativeSettings) -> Result<Option<PathBuf>> {
    if let Some(path) = &settings.preload_library_path {
        if path.exists() {
            debug!("Using preload library: {:?}", path);
            return Ok(Some(path.clone()));
        }
        return Err(AirgapError::InterceptionFailed(format!(
            "Preload library not found: {:?}",
            path
        )));
    }

    let standard_paths = [
        PathBuf::from("/usr/lib/airgap").join(PRELOAD_LIBRARY_NAME),
        PathBuf::from("/usr/local/lib/airgap").join(PRELOAD_LIBRARY_NAME),
        PathBuf::from("./target/release").join(PRELOAD_LIBRARY_NAME),
    ];
    for path in standard_paths {
        if path.exists() {
            debug!("Found preload library at: {:?}", path);
            return Ok(Some(path));
        }
    }

    warn!("Preload library not found in standard locations");
    Ok(None)
}

/// Environment for a child process that should start with Layer A installed
pub fn preload_env_vars(settings: &NativeSettings) -> Vec<(String, String)> {
    let preload_var = if cfg!(target_os = "linux") {
        "LD_PRELOAD"
    } else if cfg!(target_os = "macos") {
        "DYLD_INSERT_LIBRARIES"
    } else {
        warn!("Native preload hooks are not supported on this platform");
        return Vec::new();
    };

    let mut env_vars = Vec::new();
    match preload_library(settings) {
        Ok(Some(path)) => {
            env_vars.push((preload_var.to_string(), path.to_string_lossy().to_string()));
        }
        Ok(None) => {}
        Err(e) => warn!("{}", e),
    }

    if settings.debug {
        env_vars.push(("AIRGAP_NATIVE__DEBUG".to_string(), "true".to_string()));
    }
    if let Some(config_path) = std::env::var_os(crate::utils::config::CONFIG_PATH_ENV) {
        env_vars.push((
            crate::utils::config::CONFIG_PATH_ENV.to_string(),
            config_path.to_string_lossy().to_string(),
        ));
    }

    env_vars
}
