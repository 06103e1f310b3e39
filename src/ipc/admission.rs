//! Admission control for a service.
//!
//! A counter guarded by one mutex, with a condition variable for callers
//! waiting on a free slot. `0 <= active <= limit` holds whenever the lock is
//! released. Slots are handed out as [`Slot`] guards that give the capacity
//! back when dropped, so a slot is released exactly once no matter which path
//! finishes the exchange.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct AdmissionState {
    active: usize,
    closed: bool,
}

/// Bounded pool of admission slots.
#[derive(Debug)]
pub struct Admission {
    limit: usize,
    state: Mutex<AdmissionState>,
    /// Signaled once per released slot.
    slot_freed: Condvar,
    /// Signaled when `active` drops to zero or admission closes.
    drained: Condvar,
}

impl Admission {
    /// Create a controller admitting at most `limit` concurrent holders.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            state: Mutex::new(AdmissionState {
                active: 0,
                closed: false,
            }),
            slot_freed: Condvar::new(),
            drained: Condvar::new(),
        })
    }

    /// Wait up to `timeout` for a free slot.
    ///
    /// The deadline is fixed when the wait starts; spurious wakeups do not
    /// extend it. Returns `None` on timeout or once admission is closed,
    /// leaving the counter untouched.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Option<Slot> {
        let guard = self.lock();
        let (mut guard, _) = self
            .slot_freed
            .wait_timeout_while(guard, timeout, |s| !s.closed && s.active >= self.limit)
            .unwrap_or_else(PoisonError::into_inner);

        if guard.closed || guard.active >= self.limit {
            return None;
        }

        guard.active += 1;
        Some(Slot {
            admission: Arc::clone(self),
        })
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Maximum number of slots.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Refuse further acquisitions and wake every waiter.
    ///
    /// Slots already handed out stay valid and are released normally.
    pub fn close(&self) {
        self.lock().closed = true;
        self.slot_freed.notify_all();
        self.drained.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait up to `timeout` for every held slot to be released.
    ///
    /// Returns true if the controller is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .drained
            .wait_timeout_while(guard, timeout, |s| s.active > 0)
            .unwrap_or_else(PoisonError::into_inner);
        guard.active == 0
    }

    fn release(&self) {
        let mut guard = self.lock();
        debug_assert!(guard.active > 0, "released more slots than acquired");
        guard.active = guard.active.saturating_sub(1);
        let idle = guard.active == 0;
        drop(guard);

        self.slot_freed.notify_one();
        if idle {
            self.drained.notify_all();
        }
    }

    // The state is a plain counter, so a panic while holding the lock cannot
    // leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One unit of admitted concurrency. Released on drop.
#[must_use = "dropping a slot releases it immediately"]
pub struct Slot {
    admission: Arc<Admission>,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("limit", &self.admission.limit)
            .finish()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.admission.release();
    }
}
