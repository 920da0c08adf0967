// src/utils/config.rs
//! Layered configuration
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults (`Default` impls below)
//! 2. `airgap.toml` in the working directory, or the file named by `AIRGAP_CONFIG`
//! 3. `AIRGAP_*` environment variables, `__` between nested keys, e.g.
//!    `AIRGAP_DEFAULTS__ALLOWED_HOSTS=localhost,*.internal`

use crate::policy::pattern::HostPattern;
use crate::utils::errors::{AirgapError, Result};
use config::{Config, Environment, File};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "AIRGAP_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "airgap.toml";

const LIST_KEYS: &[&str] = &[
    "defaults.allowed_hosts",
    "defaults.blocked_hosts",
    "engine.exempt_stack_markers",
    "engine.harness_thread_prefixes",
];

static GLOBAL_CONFIG: Lazy<AirgapConfig> = Lazy::new(|| match AirgapConfig::load() {
    Ok(config) => config,
    Err(e) => {
        warn!("Failed to load airgap configuration, using defaults: {}", e);
        AirgapConfig::default()
    }
});

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AirgapConfig {
    /// Process-wide defaults merged under every test's annotations
    pub defaults: GlobalDefaults,

    /// Decision engine tuning
    pub engine: EngineSettings,

    /// Low-level hook settings
    pub native: NativeSettings,

    /// Logging output
    pub logging: LoggingSettings,
}

/// Global defaults applied to every test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalDefaults {
    /// Guard every test, not only the ones that ask for it
    pub apply_to_all_tests: bool,

    /// Host patterns allowed in every guarded test
    pub allowed_hosts: Vec<String>,

    /// Host patterns blocked in every guarded test
    pub blocked_hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Frames kept in the stack snippet of a blocked-request error
    pub stack_snippet_depth: usize,

    /// Stack frame substrings identifying harness infrastructure traffic
    pub exempt_stack_markers: Vec<String>,

    /// Thread name prefixes identifying harness infrastructure threads
    pub harness_thread_prefixes: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stack_snippet_depth: 12,
            exempt_stack_markers: Vec::new(),
            harness_thread_prefixes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeSettings {
    /// Path to the preload shim (`libairgap_engine.so` built with `--features preload`)
    pub preload_library_path: Option<PathBuf>,

    /// Verbose per-call hook tracing
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `AIRGAP_LOG`
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
            json: false,
        }
    }
}

impl AirgapConfig {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut environment = Environment::with_prefix("AIRGAP")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let settings = Config::builder()
            .add_source(File::from(path.as_path()).required(false))
            .add_source(environment)
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        debug!("Configuration loaded from {:?} and environment", path);
        Ok(config)
    }

    /// Process-wide configuration, loaded once on first use
    pub fn global() -> &'static AirgapConfig {
        &GLOBAL_CONFIG
    }

    /// Load from an explicit file only, ignoring the environment
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AirgapError::ConfigError(format!(
                "Configuration file not found: {:?}",
                path
            )));
        }

        let settings = Config::builder()
            .add_source(File::from(path).required(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject patterns the matcher would never be able to match sensibly
    pub fn validate(&self) -> Result<()> {
        for pattern in self
            .defaults
            .allowed_hosts
            .iter()
            .chain(self.defaults.blocked_hosts.iter())
        {
            HostPattern::parse(pattern)?;
        }

        if self.engine.stack_snippet_depth == 0 {
            return Err(AirgapError::ConfigError(
                "engine.stack_snippet_depth must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
