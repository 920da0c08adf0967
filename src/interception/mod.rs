// src/interception/mod.rs
//! Interception layers
//!
//! - **Native hook (Layer A)**: libc `connect` / `getaddrinfo`, installed by
//!   the preload shim, subject to bind order
//! - **Managed hook (Layer B)**: guarded resolver wrappers, switchable at any time
//! - **Bridge**: how either layer finds the decision engine, failing open
//!
//! # Architecture
//!
//! ```text
//! code under test
//!     │
//!     ├─ ToSocketAddrs / hyper-util / trust-dns → ManagedHooks::prologue ─┐
//!     │                                                                   ├─→ bridge::resolve() → engine
//!     └─ connect(2) / getaddrinfo(3) → preload shim → NativeHookTable ────┘
//! ```

pub mod bridge;
pub mod managed_hook;
pub mod native_hook;

#[cfg(all(feature = "preload", unix))]
pub mod preload;

pub use bridge::{BridgeResolver, EngineBridge};
pub use managed_hook::{GuardedAsyncResolver, GuardedResolver, ManagedEntryPoint, ManagedHooks};
pub use native_hook::{AddressBook, BindState, InstallReport, NativeEntryPoint, NativeHookTable};
