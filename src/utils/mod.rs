// src/utils/mod.rs
//! Common utilities shared by every layer
//!
//! - **errors**: `AirgapError` and the structured blocked-request error
//! - **config**: layered configuration (defaults, `airgap.toml`, `AIRGAP_*` env)

pub mod config;
pub mod errors;

pub use config::AirgapConfig;
pub use errors::{AirgapError, NetworkRequestAttempted, Result};
