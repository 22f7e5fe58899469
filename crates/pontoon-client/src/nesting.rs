//! Per-thread call-nesting depth, diagnostic only.
//!
//! The host application can re-enter the API shim from callbacks; when
//! chasing such reentrancy in logs it helps to know how deep we are on
//! the current thread. No behavior depends on this counter.

use std::cell::Cell;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Current nesting depth on this thread.
pub fn call_depth() -> usize {
    DEPTH.with(|depth| depth.get())
}

/// RAII guard incrementing the depth for its lifetime.
pub struct CallScope;

impl CallScope {
    pub fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        CallScope
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}
