//! Time source and deadlines
//!
//! The stack never spins on a fixed iteration count. Anything that waits
//! (DHCP, ping, DNS, the blocking ARP helper) takes a [`Deadline`] against a
//! [`Clock`] and calls [`Clock::relax`] between polls, which is where a
//! kernel can halt until the next interrupt or yield to the scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic millisecond time source
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;

    /// Called while waiting for something to arrive
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Clock advanced by a periodic timer interrupt
///
/// The interrupt handler calls [`TickClock::tick`] with the timer period.
#[derive(Debug, Default)]
pub struct TickClock {
    millis: AtomicU64,
}

impl TickClock {
    pub const fn new() -> Self {
        Self {
            millis: AtomicU64::new(0),
        }
    }

    /// Advance the clock by `ms` milliseconds
    pub fn tick(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for TickClock {
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::Relaxed)
    }
}

/// Point in time after which a wait gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: u64,
}

impl Deadline {
    /// Deadline `timeout_ms` from now
    pub fn after(clock: &dyn Clock, timeout_ms: u64) -> Self {
        Self {
            expires_at: clock.now_ms().saturating_add(timeout_ms),
        }
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.now_ms() >= self.expires_at
    }

    /// Milliseconds left, zero once expired
    pub fn remaining_ms(&self, clock: &dyn Clock) -> u64 {
        self.expires_at.saturating_sub(clock.now_ms())
    }
}

/// Repeatedly run `poll` until it yields a value or `timeout_ms` elapses
///
/// `poll` always runs at least once, so a zero timeout is a single check.
pub fn poll_until<T>(
    clock: &dyn Clock,
    timeout_ms: u64,
    mut poll: impl FnMut() -> Option<T>,
) -> Option<T> {
    let deadline = Deadline::after(clock, timeout_ms);
    loop {
        if let Some(value) = poll() {
            return Some(value);
        }
        if deadline.is_expired(clock) {
            return None;
        }
        clock.relax();
    }
}
