// src/policy/pattern.rs
//! Host pattern matching
//!
//! A pattern is a literal host or IP, `"*"`, or a wildcard such as
//! `*.example.com`. Every `*` expands to "zero or more of any character" and
//! the whole host must match, so `*.example.com` matches `api.example.com`
//! but never the bare `example.com`. Matching ignores ASCII case.

use crate::utils::errors::{AirgapError, Result};
use regex::{Regex, RegexBuilder};
use std::fmt;

/// Compiled host pattern
#[derive(Clone)]
pub struct HostPattern {
    /// Pattern as written
    source: String,

    /// Anchored matcher, `None` for the match-all pattern
    matcher: Option<Regex>,
}

impl HostPattern {
    /// Compile a pattern
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();

        if pattern.is_empty() {
            return Err(invalid(pattern, "pattern is empty"));
        }
        if pattern.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(invalid(pattern, "hosts cannot contain whitespace or '/'"));
        }

        if pattern == "*" {
            return Ok(Self {
                source: pattern.to_string(),
                matcher: None,
            });
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let matcher = RegexBuilder::new(&format!("^{}$", body))
            .case_insensitive(true)
            .build()
            .map_err(|e| invalid(pattern, &e.to_string()))?;

        Ok(Self {
            source: pattern.to_string(),
            matcher: Some(matcher),
        })
    }

    /// Test a host against this pattern
    pub fn matches(&self, host: &str) -> bool {
        match &self.matcher {
            None => true,
            Some(matcher) => !host.is_empty() && matcher.is_match(host),
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.matcher.is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostPattern").field(&self.source).finish()
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// Identity is the case-folded source; two spellings of one pattern are one pattern.
impl PartialEq for HostPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source.eq_ignore_ascii_case(&other.source)
    }
}

impl Eq for HostPattern {}

/// One-shot match of `host` against an uncompiled `pattern`.
///
/// Invalid patterns match nothing except through the `"*"` rule.
pub fn matches(host: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    HostPattern::parse(pattern)
        .map(|compiled| compiled.matches(host))
        .unwrap_or(false)
}

fn invalid(pattern: &str, reason: &str) -> AirgapError {
    AirgapError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}
