// src/stacks.rs
//
// Long-stack diagnostics. Everything here is gated by a run-time flag:
// with diagnostics off, no stack is captured and every promise's
// diagnostic fields stay empty.
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::rc::Rc;

/// Maximum length of a `prev` chain; links beyond this are not recorded.
pub(crate) const LONG_STACKS_CLIP_LIMIT: u32 = 100;
/// Maximum number of ancestor stacks rendered into one long stack.
pub(crate) const MAX_LONG_STACKS: usize = 20;

thread_local! {
    static DEBUG: Cell<bool> = const { Cell::new(false) };
}

/// Enable or disable long-stack capture for promises created afterwards.
pub fn set_debug(on: bool) {
    DEBUG.with(|d| d.set(on));
}

#[inline]
pub fn debug() -> bool {
    DEBUG.with(|d| d.get())
}

/// Capture the host stack when diagnostics are enabled.
pub(crate) fn capture() -> Option<Rc<Backtrace>> {
    if debug() {
        Some(Rc::new(Backtrace::force_capture()))
    } else {
        None
    }
}

/// Render a captured stack, dropping scheduler-internal frames so the
/// interesting part reads first.
pub(crate) fn pretty(bt: &Backtrace) -> String {
    filter_frames(&bt.to_string())
}

fn filter_frames(raw: &str) -> String {
    let mut out = String::new();
    let mut skip_location = false;
    for line in raw.lines() {
        let trimmed = line.trim_start();
        // Frame headers look like "12: path::to::symbol"; the lines after
        // one ("at file:line") belong to it and share its fate.
        let is_frame = trimmed
            .split(':')
            .next()
            .is_some_and(|head| !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()));
        if is_frame {
            skip_location = internal_frame(trimmed);
            if skip_location {
                continue;
            }
        } else if skip_location {
            continue;
        }
        out.push('\n');
        out.push_str(line);
    }
    out
}

fn internal_frame(frame: &str) -> bool {
    const HIDDEN: &[&str] = &[
        "strand::tick::",
        "strand::promise::",
        "strand::stacks::",
        "std::",
        "core::ops::",
        "__rust_begin_short_backtrace",
    ];
    HIDDEN.iter().any(|m| frame.contains(m))
}
