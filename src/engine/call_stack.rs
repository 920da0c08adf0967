// src/engine/call_stack.rs
//! Lazily captured call stacks
//!
//! Capturing a backtrace is by far the most expensive thing the engine does,
//! so a `CallStack` captures on first access only. Allowed calls under an
//! engine without stack markers never pay for it.

use once_cell::sync::OnceCell;
use std::backtrace::Backtrace;

/// Frames belonging to the capture machinery and to this crate's hook path
const INTERNAL_FRAME_PREFIXES: &[&str] = &[
    "std::backtrace",
    "<std::backtrace",
    "airgap_engine::engine::",
    "airgap_engine::interception::",
    "airgap_engine::context::",
    "<airgap_engine::",
];

/// Library glue that may sit between internal frames (closures, lazy init)
const GLUE_FRAME_PREFIXES: &[&str] = &[
    "core::",
    "<core::",
    "std::",
    "<std::",
    "alloc::",
    "<alloc::",
    "once_cell::",
    "<once_cell::",
    "parking_lot::",
    "<parking_lot::",
];

/// Call stack of an intercepted attempt
#[derive(Debug, Default)]
pub struct CallStack {
    frames: OnceCell<Vec<String>>,
}

impl CallStack {
    /// Stack that captures the current thread's backtrace on first access
    pub fn lazy() -> Self {
        Self::default()
    }

    /// Stack with known frames, innermost first
    pub fn from_frames<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let frames = frames.into_iter().map(Into::into).collect::<Vec<String>>();
        Self {
            frames: OnceCell::with_value(frames),
        }
    }

    /// Whether the frames have been materialised yet
    pub fn is_captured(&self) -> bool {
        self.frames.get().is_some()
    }

    /// Symbol names, innermost first, without the engine's own frames
    pub fn frames(&self) -> &[String] {
        self.frames.get_or_init(capture_frames)
    }

    /// True if any frame contains `marker`
    pub fn contains(&self, marker: &str) -> bool {
        self.frames().iter().any(|frame| frame.contains(marker))
    }

    /// At most `depth` frames, one per line, with a trailer when truncated
    pub fn snippet(&self, depth: usize) -> String {
        let frames = self.frames();
        let mut lines: Vec<String> = frames
            .iter()
            .take(depth)
            .map(|frame| format!("    at {}", frame))
            .collect();

        if frames.len() > depth {
            lines.push(format!("    ... {} more", frames.len() - depth));
        }

        lines.join("\n")
    }
}

fn capture_frames() -> Vec<String> {
    let rendered = Backtrace::force_capture().to_string();
    strip_internal(parse_symbols(&rendered))
}

/// Drop the innermost run of internal and glue frames, up to and including
/// the last internal one. Frames past the first caller frame are kept even
/// when internal (e.g. a thread spawned through the context module).
fn strip_internal(symbols: Vec<String>) -> Vec<String> {
    let mut start = 0;
    for (index, symbol) in symbols.iter().enumerate() {
        if is_internal(symbol) {
            start = index + 1;
        } else if !is_glue(symbol) {
            break;
        }
    }
    symbols.into_iter().skip(start).collect()
}

/// Extract the symbol of each `N: symbol` line of a rendered backtrace
fn parse_symbols(rendered: &str) -> Vec<String> {
    rendered
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim_start().split_once(": ")?;
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some(symbol.trim().to_string())
        })
        .collect()
}

fn is_internal(symbol: &str) -> bool {
    // unit tests live under the crate's own module paths
    if symbol.contains("::tests::") {
        return false;
    }
    INTERNAL_FRAME_PREFIXES
        .iter()
        .any(|prefix| symbol.starts_with(prefix))
}

fn is_glue(symbol: &str) -> bool {
    GLUE_FRAME_PREFIXES
        .iter()
        .any(|prefix| symbol.starts_with(prefix))
}
