//! Input-Activity Throttle
//!
//! The relay sees every input event; the operator UI only needs a pulse.
//! This throttle coalesces the stream into at most one notification per
//! two seconds or per fifty events, whichever comes first, and resets its
//! counter after each emission.

use std::time::{Duration, Instant};

/// Notify at least this often while events flow.
const MAX_INTERVAL: Duration = Duration::from_secs(2);

/// ... or after this many events, whichever comes first.
const MAX_EVENTS: u32 = 50;

/// Coalesces per-event ticks into sparse notifications.
#[derive(Debug)]
pub struct ActivityThrottle {
    pending: u32,
    last_emit: Instant,
}

impl ActivityThrottle {
    /// Fresh throttle with nothing pending.
    pub fn new() -> Self {
        Self {
            pending: 0,
            last_emit: Instant::now(),
        }
    }

    /// Record one event. Returns the pending count when a notification is
    /// due, resetting the counter.
    pub fn tick(&mut self) -> Option<u32> {
        self.pending += 1;
        if self.pending >= MAX_EVENTS || self.last_emit.elapsed() >= MAX_INTERVAL {
            let count = self.pending;
            self.pending = 0;
            self.last_emit = Instant::now();
            Some(count)
        } else {
            None
        }
    }
}

impl Default for ActivityThrottle {
    fn default() -> Self {
        Self::new()
    }
}
