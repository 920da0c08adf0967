// src/policy/configuration.rs
//! Immutable allow/block configuration for one test's execution scope
//!
//! Blocked patterns always take precedence over allowed patterns, and an
//! empty allow set allows nothing.

use crate::policy::pattern::HostPattern;
use crate::utils::errors::Result;

/// Allow/block host patterns for one activation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    allowed: Vec<HostPattern>,
    blocked: Vec<HostPattern>,

    /// Store generation this configuration was activated under.
    /// Assigned by `ContextStore::set_configuration`, never by callers.
    pub(crate) generation: u64,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Configuration that allows nothing
    pub fn block_all() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn allowed_patterns(&self) -> &[HostPattern] {
        &self.allowed
    }

    pub fn blocked_patterns(&self) -> &[HostPattern] {
        &self.blocked
    }

    /// True when any blocked pattern matches `host`
    pub fn is_explicitly_blocked(&self, host: &str) -> bool {
        self.blocked.iter().any(|pattern| pattern.matches(host))
    }

    /// True when any allowed pattern matches `host`, ignoring blocks
    pub fn is_listed_as_allowed(&self, host: &str) -> bool {
        self.allowed.iter().any(|pattern| pattern.matches(host))
    }

    /// Full allow/block verdict for a host
    pub fn is_allowed(&self, host: &str) -> bool {
        !self.is_explicitly_blocked(host) && self.is_listed_as_allowed(host)
    }

    /// Union of both configurations' pattern sets
    pub fn merge(&self, other: &Configuration) -> Configuration {
        let mut merged = self.clone();
        for pattern in &other.allowed {
            push_unique(&mut merged.allowed, pattern.clone());
        }
        for pattern in &other.blocked {
            push_unique(&mut merged.blocked, pattern.clone());
        }
        merged.generation = 0;
        merged
    }
}

/// Builder collecting raw pattern strings
#[derive(Debug, Default, Clone)]
pub struct ConfigurationBuilder {
    allowed: Vec<String>,
    blocked: Vec<String>,
}

impl ConfigurationBuilder {
    pub fn allow(mut self, pattern: impl Into<String>) -> Self {
        self.allowed.push(pattern.into());
        self
    }

    pub fn allow_all(self) -> Self {
        self.allow("*")
    }

    pub fn allow_hosts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn block(mut self, pattern: impl Into<String>) -> Self {
        self.blocked.push(pattern.into());
        self
    }

    pub fn block_hosts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Compile every pattern, failing on the first invalid one
    pub fn build(self) -> Result<Configuration> {
        Ok(Configuration {
            allowed: compile(&self.allowed)?,
            blocked: compile(&self.blocked)?,
            generation: 0,
        })
    }
}

fn compile(patterns: &[String]) -> Result<Vec<HostPattern>> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        push_unique(&mut compiled, HostPattern::parse(pattern)?);
    }
    Ok(compiled)
}

fn push_unique(patterns: &mut Vec<HostPattern>, pattern: HostPattern) {
    if !patterns.contains(&pattern) {
        patterns.push(pattern);
    }
}
