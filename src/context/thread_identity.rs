// src/context/thread_identity.rs
//! Harness-infrastructure thread identification
//!
//! Threads owned by the test harness itself (dependency resolution, artifact
//! fetching, result reporting) must never pick up a test's configuration
//! through the process-wide fallback. Telling them apart from test worker
//! threads is a heuristic, so it is a strategy the embedder supplies rather
//! than a fixed list of thread names.

use std::fmt;
use std::thread::Thread;

/// Decides whether a thread belongs to harness infrastructure
pub trait ThreadClassifier: Send + Sync {
    fn is_harness_infrastructure(&self, thread: &Thread) -> bool;
}

impl<F> ThreadClassifier for F
where
    F: Fn(&Thread) -> bool + Send + Sync,
{
    fn is_harness_infrastructure(&self, thread: &Thread) -> bool {
        self(thread)
    }
}

/// Treats every thread as a test thread
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHarnessThreads;

impl ThreadClassifier for NoHarnessThreads {
    fn is_harness_infrastructure(&self, _thread: &Thread) -> bool {
        false
    }
}

/// Matches thread names against configured prefixes
#[derive(Clone, Default)]
pub struct ThreadNamePrefixes {
    prefixes: Vec<String>,
}

impl ThreadNamePrefixes {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl ThreadClassifier for ThreadNamePrefixes {
    fn is_harness_infrastructure(&self, thread: &Thread) -> bool {
        match thread.name() {
            Some(name) => self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())),
            // unnamed threads are spawned by code under test
            None => false,
        }
    }
}

impl fmt::Debug for ThreadNamePrefixes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.prefixes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn classify_named(name: &str, classifier: impl ThreadClassifier + 'static) -> bool {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || classifier.is_harness_infrastructure(&thread::current()))
            .unwrap()
            .join()
            .unwrap()
    }

    #[test]
    fn test_no_harness_threads() {
        assert!(!classify_named("harness-resolver-1", NoHarnessThreads));
    }

    #[test]
    fn test_prefix_match() {
        let classifier = ThreadNamePrefixes::new(["harness-resolver", "artifact-fetch"]);
        assert!(classify_named("harness-resolver-3", classifier.clone()));
        assert!(classify_named("artifact-fetch", classifier.clone()));
        assert!(!classify_named("test-worker-1", classifier));
    }

    #[test]
    fn test_unnamed_thread_is_not_harness() {
        let classifier = ThreadNamePrefixes::new(["harness"]);
        let result = thread::spawn(move || classifier.is_harness_infrastructure(&thread::current()))
            .join()
            .unwrap();
        assert!(!result);
    }

    #[test]
    fn test_empty_prefixes_ignored() {
        let classifier = ThreadNamePrefixes::new(["", "daemon"]);
        assert!(!classifier.is_empty());
        assert!(!classify_named("worker", classifier));
    }

    #[test]
    fn test_closure_classifier() {
        let classifier = |t: &Thread| t.name() == Some("infra");
        assert!(classify_named("infra", classifier));
        assert!(!classify_named("infra-2", classifier));
    }
}
