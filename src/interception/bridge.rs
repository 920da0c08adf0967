// src/interception/bridge.rs
//! Hook → engine bridge
//!
//! Hooks never hold an engine directly. They resolve one per call, in order:
//!
//! ```text
//! 1. engine registered in this image      (register)
//! 2. airgap_bridge_v1 found by dlsym      (preload shim → host process)
//! 3. nothing                              → fail open
//! ```
//!
//! The preload shim is a separate copy of this crate with its own statics,
//! so it reaches the host's engine through the exported `#[repr(C)]` vtable.
//! The shim build does not export the symbol itself. The host binary must
//! export its dynamic symbols (`-C link-args=-rdynamic`).

use crate::engine::decision::DecisionEngine;
use crate::utils::errors::NetworkRequestAttempted;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::ffi::{c_char, c_int, CStr, CString};
use std::fmt;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Name of the exported vtable symbol
pub const BRIDGE_SYMBOL: &str = "airgap_bridge_v1";

/// Layout version of `BridgeVTable`
pub const BRIDGE_ABI_VERSION: u32 = 1;

/// Capacity of the stack buffer handed across the C boundary
const STACK_BUFFER_LEN: usize = 4096;

/// Separator of the hostname list passed to `check_connection` over C
const HOSTNAME_SEPARATOR: char = '\n';

/// Minimum delay between two failed symbol lookups
const SYMBOL_RETRY_INTERVAL: Duration = Duration::from_millis(500);

static REGISTERED: Lazy<RwLock<Option<Arc<dyn EngineBridge>>>> = Lazy::new(|| RwLock::new(None));

static SYMBOL_BRIDGE: Lazy<RwLock<SymbolCache>> = Lazy::new(|| RwLock::new(SymbolCache::default()));

static UNRESOLVED_WARNED: AtomicBool = AtomicBool::new(false);

/// What a hook needs from the engine
pub trait EngineBridge: Send + Sync {
    /// Cheap probe; `false` lets the hook skip all argument extraction
    fn has_active_configuration(&self) -> bool;

    /// Decide on `host:port`
    fn check(&self, host: &str, port: i32, caller: &str) -> Result<(), NetworkRequestAttempted>;

    /// Decide on a connection to `ip`, resolved from `hostnames` when known
    fn check_connection(
        &self,
        ip: IpAddr,
        hostnames: &[&str],
        port: u16,
        caller: &str,
    ) -> Result<(), NetworkRequestAttempted>;

    fn is_explicitly_blocked(&self, host: &str) -> bool;
}

impl EngineBridge for DecisionEngine {
    fn has_active_configuration(&self) -> bool {
        DecisionEngine::has_active_configuration(self)
    }

    fn check(&self, host: &str, port: i32, caller: &str) -> Result<(), NetworkRequestAttempted> {
        DecisionEngine::check(self, host, port, caller)
    }

    fn check_connection(
        &self,
        ip: IpAddr,
        hostnames: &[&str],
        port: u16,
        caller: &str,
    ) -> Result<(), NetworkRequestAttempted> {
        self.decide_connection(ip, hostnames, port, caller).into_result()
    }

    fn is_explicitly_blocked(&self, host: &str) -> bool {
        DecisionEngine::is_explicitly_blocked(self, host)
    }
}

/// Make `engine` the one hooks in this image resolve. Replaces any previous
/// registration.
pub fn register(engine: Arc<dyn EngineBridge>) {
    *REGISTERED.write() = Some(engine);
    info!("Decision engine registered with the interception bridge");
}

/// Drop the registration; hooks fail open afterwards unless the symbol
/// lookup finds another engine.
pub fn unregister() {
    *REGISTERED.write() = None;
}

pub fn is_registered() -> bool {
    REGISTERED.read().is_some()
}

fn registered() -> Option<Arc<dyn EngineBridge>> {
    REGISTERED.read().clone()
}

/// Engine for a hook invocation, or `None` to fail open
pub fn resolve() -> Option<Arc<dyn EngineBridge>> {
    if let Some(engine) = registered() {
        return Some(engine);
    }

    let found = symbol_bridge();
    if found.is_none() && !UNRESOLVED_WARNED.swap(true, Ordering::Relaxed) {
        warn!(
            "No decision engine reachable from the interception hooks, network calls pass through"
        );
    }
    found
}

/// Outcome of the `airgap_bridge_v1` lookup. A hit is kept for the process
/// lifetime; a miss is retried once `SYMBOL_RETRY_INTERVAL` has passed, so a
/// host library loaded later with `RTLD_GLOBAL` is still found.
#[derive(Default)]
struct SymbolCache {
    bridge: Option<Arc<dyn EngineBridge>>,
    last_miss: Option<Instant>,
}

impl SymbolCache {
    fn hit(&self) -> Option<Arc<dyn EngineBridge>> {
        self.bridge.clone()
    }

    fn get_or_retry(
        &mut self,
        now: Instant,
        lookup: impl FnOnce() -> Option<Arc<dyn EngineBridge>>,
    ) -> Option<Arc<dyn EngineBridge>> {
        if self.bridge.is_some() {
            return self.hit();
        }
        if let Some(last_miss) = self.last_miss {
            if now.saturating_duration_since(last_miss) < SYMBOL_RETRY_INTERVAL {
                return None;
            }
        }

        self.bridge = lookup();
        if self.bridge.is_none() {
            self.last_miss = Some(now);
        }
        self.hit()
    }
}

fn symbol_bridge() -> Option<Arc<dyn EngineBridge>> {
    if let Some(bridge) = SYMBOL_BRIDGE.read().hit() {
        return Some(bridge);
    }
    SYMBOL_BRIDGE
        .write()
        .get_or_retry(Instant::now(), lookup_symbol)
}

/// How a hook instance finds its engine
#[derive(Clone, Default)]
pub enum BridgeResolver {
    /// `resolve()` on every call
    #[default]
    Dynamic,

    /// Always this engine
    Fixed(Arc<dyn EngineBridge>),
}

impl BridgeResolver {
    pub fn resolve(&self) -> Option<Arc<dyn EngineBridge>> {
        match self {
            BridgeResolver::Dynamic => resolve(),
            BridgeResolver::Fixed(engine) => Some(Arc::clone(engine)),
        }
    }
}

impl fmt::Debug for BridgeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeResolver::Dynamic => f.write_str("Dynamic"),
            BridgeResolver::Fixed(_) => f.write_str("Fixed(..)"),
        }
    }
}

/// C view of the registered engine
///
/// Strings are NUL-terminated UTF-8. `hostnames` in `check_connection` is a
/// newline-separated list and may be null. A block returns 1 and writes the
/// stack snippet into `stack_out` (truncated, always NUL-terminated when
/// `stack_len > 0`).
#[repr(C)]
pub struct BridgeVTable {
    pub abi_version: u32,
    pub has_active_configuration: unsafe extern "C" fn() -> c_int,
    pub check: unsafe extern "C" fn(
        host: *const c_char,
        port: c_int,
        caller: *const c_char,
        stack_out: *mut c_char,
        stack_len: usize,
    ) -> c_int,
    pub check_connection: unsafe extern "C" fn(
        ip: *const c_char,
        hostnames: *const c_char,
        port: c_int,
        caller: *const c_char,
        stack_out: *mut c_char,
        stack_len: usize,
    ) -> c_int,
    pub is_explicitly_blocked: unsafe extern "C" fn(host: *const c_char) -> c_int,
}

#[cfg_attr(not(feature = "preload"), no_mangle)]
#[allow(non_upper_case_globals)]
pub static airgap_bridge_v1: BridgeVTable = BridgeVTable {
    abi_version: BRIDGE_ABI_VERSION,
    has_active_configuration: vtable_has_active_configuration,
    check: vtable_check,
    check_connection: vtable_check_connection,
    is_explicitly_blocked: vtable_is_explicitly_blocked,
};

// Every entry point answers "allow" when nothing is registered or when the
// engine panics: a panic must not unwind into C.

unsafe extern "C" fn vtable_has_active_configuration() -> c_int {
    let active = panic::catch_unwind(|| {
        registered().map_or(false, |engine| engine.has_active_configuration())
    });
    c_int::from(active.unwrap_or(false))
}

unsafe extern "C" fn vtable_check(
    host: *const c_char,
    port: c_int,
    caller: *const c_char,
    stack_out: *mut c_char,
    stack_len: usize,
) -> c_int {
    let (Some(host), Some(caller)) = (c_str(host), c_str(caller)) else {
        return 0;
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        registered().map(|engine| engine.check(host, port, caller))
    }));
    match outcome {
        Ok(Some(Err(blocked))) => {
            write_c_buffer(&blocked.stack, stack_out, stack_len);
            1
        }
        _ => 0,
    }
}

unsafe extern "C" fn vtable_check_connection(
    ip: *const c_char,
    hostnames: *const c_char,
    port: c_int,
    caller: *const c_char,
    stack_out: *mut c_char,
    stack_len: usize,
) -> c_int {
    let (Some(ip), Some(caller)) = (c_str(ip), c_str(caller)) else {
        return 0;
    };
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return 0;
    };
    let Ok(port) = u16::try_from(port) else {
        return 0;
    };
    let hostnames: Vec<&str> = c_str(hostnames)
        .map(|list| {
            list.split(HOSTNAME_SEPARATOR)
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        registered().map(|engine| engine.check_connection(ip, &hostnames, port, caller))
    }));
    match outcome {
        Ok(Some(Err(blocked))) => {
            write_c_buffer(&blocked.stack, stack_out, stack_len);
            1
        }
        _ => 0,
    }
}

unsafe extern "C" fn vtable_is_explicitly_blocked(host: *const c_char) -> c_int {
    let Some(host) = c_str(host) else {
        return 0;
    };
    let blocked = panic::catch_unwind(AssertUnwindSafe(|| {
        registered().map_or(false, |engine| engine.is_explicitly_blocked(host))
    }));
    c_int::from(blocked.unwrap_or(false))
}

/// Borrow a C string as UTF-8; null or invalid input yields `None`
pub(crate) unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

unsafe fn write_c_buffer(text: &str, out: *mut c_char, len: usize) {
    if out.is_null() || len == 0 {
        return;
    }
    let bytes = text.as_bytes();
    let n = bytes.len().min(len - 1);
    std::ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), out, n);
    *out.add(n) = 0;
}

/// Engine reached through another image's exported vtable
struct SymbolBridge {
    vtable: &'static BridgeVTable,
}

impl SymbolBridge {
    fn call_check(
        &self,
        host: &str,
        port: i32,
        caller: &str,
        call: impl FnOnce(*mut c_char, usize) -> c_int,
    ) -> Result<(), NetworkRequestAttempted> {
        let mut stack = vec![0u8; STACK_BUFFER_LEN];
        if call(stack.as_mut_ptr().cast::<c_char>(), stack.len()) == 0 {
            return Ok(());
        }
        let end = stack.iter().position(|b| *b == 0).unwrap_or(stack.len());
        let stack = String::from_utf8_lossy(&stack[..end]).into_owned();
        Err(NetworkRequestAttempted::new(host, port, caller, stack))
    }
}

impl EngineBridge for SymbolBridge {
    fn has_active_configuration(&self) -> bool {
        unsafe { (self.vtable.has_active_configuration)() != 0 }
    }

    fn check(&self, host: &str, port: i32, caller: &str) -> Result<(), NetworkRequestAttempted> {
        let (Ok(c_host), Ok(c_caller)) = (CString::new(host), CString::new(caller)) else {
            debug!(host, "Host not representable as a C string, passing through");
            return Ok(());
        };
        self.call_check(host, port, caller, |out, len| unsafe {
            (self.vtable.check)(c_host.as_ptr(), port, c_caller.as_ptr(), out, len)
        })
    }

    fn check_connection(
        &self,
        ip: IpAddr,
        hostnames: &[&str],
        port: u16,
        caller: &str,
    ) -> Result<(), NetworkRequestAttempted> {
        let (Ok(c_ip), Ok(c_caller)) = (CString::new(ip.to_string()), CString::new(caller)) else {
            return Ok(());
        };
        let joined = hostnames.join(&HOSTNAME_SEPARATOR.to_string());
        let c_hostnames = if hostnames.is_empty() {
            None
        } else {
            CString::new(joined).ok()
        };
        let hostnames_ptr = c_hostnames
            .as_ref()
            .map_or(std::ptr::null(), |names| names.as_ptr());

        let address = ip.to_string();
        let outcome = self.call_check(&address, i32::from(port), caller, |out, len| unsafe {
            (self.vtable.check_connection)(
                c_ip.as_ptr(),
                hostnames_ptr,
                c_int::from(port),
                c_caller.as_ptr(),
                out,
                len,
            )
        });

        // report the name the engine would have: a blocked one, else the first
        outcome.map_err(|mut blocked| {
            let reported = hostnames
                .iter()
                .find(|name| self.is_explicitly_blocked(name))
                .or_else(|| hostnames.first());
            if let Some(name) = reported {
                blocked.host = name.to_string();
            }
            blocked
        })
    }

    fn is_explicitly_blocked(&self, host: &str) -> bool {
        let Ok(c_host) = CString::new(host) else {
            return false;
        };
        unsafe { (self.vtable.is_explicitly_blocked)(c_host.as_ptr()) != 0 }
    }
}

#[cfg(unix)]
fn lookup_symbol() -> Option<Arc<dyn EngineBridge>> {
    let name = CString::new(BRIDGE_SYMBOL).ok()?;
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if ptr.is_null() {
        debug!("{} not exported by the host process", BRIDGE_SYMBOL);
        return None;
    }

    let vtable: &'static BridgeVTable = unsafe { &*(ptr as *const BridgeVTable) };
    if vtable.abi_version != BRIDGE_ABI_VERSION {
        warn!(
            "{} has ABI version {}, expected {}; ignoring it",
            BRIDGE_SYMBOL, vtable.abi_version, BRIDGE_ABI_VERSION
        );
        return None;
    }

    info!("Decision engine resolved through {}", BRIDGE_SYMBOL);
    Some(Arc::new(SymbolBridge { vtable }))
}

#[cfg(not(unix))]
fn lookup_symbol() -> Option<Arc<dyn EngineBridge>> {
    None
}
