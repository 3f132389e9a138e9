//! # Per-Thread Error Trace
//!
//! Every fatal error unwinds through nested scopes that each know one useful
//! fact about the work in progress (the path being parsed, the bundle being
//! fetched). Scopes record that fact here as the failure passes through, and
//! the entry point prints the collected lines under the original error.
//!
//! The stack is thread-local; nothing in the core shares readers or caches
//! across threads, so no synchronisation is involved.

use std::cell::RefCell;

use crate::common::QuarryResult;

thread_local! {
    static TRACE_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn push(message: String) {
    TRACE_STACK.with(|stack| stack.borrow_mut().push(message));
}

/// Removes and returns every recorded trace line, innermost scope first.
pub fn drain() -> Vec<String> {
    TRACE_STACK.with(|stack| std::mem::take(&mut *stack.borrow_mut()))
}

/// Extension adding trace context to any fallible core operation.
pub trait Traced {
    /// Records the lazily-built message when `self` is an error, then passes
    /// the value through unchanged.
    fn traced(self, message: impl FnOnce() -> String) -> Self;
}

impl<T> Traced for QuarryResult<T> {
    fn traced(self, message: impl FnOnce() -> String) -> Self {
        if self.is_err() {
            push(message());
        }
        self
    }
}
