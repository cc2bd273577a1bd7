//! Cross-device synchronization flags.
//!
//! A flag is a monotonically increasing 64-bit counter with exactly one
//! writer and one reader. The writer publishes payload first and then the
//! flag (release fence before the store); the reader spins until the flag
//! reaches the value it expects and then issues an acquire fence, after which
//! the payload written before that value is visible. Comparing by magnitude
//! distinguishes stale values from fresh ones.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use crossbeam_utils::{Backoff, CachePadded};

/// A single-writer / single-reader monotonic flag living in a transport
/// region.
#[derive(Debug, Default)]
pub struct CrossDeviceFlag {
    value: CachePadded<AtomicU64>,
}

impl CrossDeviceFlag {
    pub const fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Publish `value`. Every write issued by this thread before the call is
    /// visible to a reader that observes `value`.
    pub fn post(&self, value: u64) {
        debug_assert!(
            value >= self.value.load(Ordering::Relaxed),
            "flag went backwards"
        );
        fence(Ordering::Release);
        self.value.store(value, Ordering::Relaxed);
    }

    /// Spin until the flag is at least `target`.
    pub fn wait(&self, target: u64) {
        let backoff = Backoff::new();
        while self.value.load(Ordering::Relaxed) < target {
            backoff.snooze();
        }
        fence(Ordering::Acquire);
    }

    /// Current value without synchronization guarantees for payload.
    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero. Only valid once both sides have retired the collective.
    pub fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }
}
