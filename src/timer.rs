//! Named timers with cancellation.
//!
//! `TimerManager` owns the id-to-callback correlation; actual scheduling
//! is delegated to a platform `TimerInterface`. The session arms two
//! timers through this path: the periodic rekey timer and the datapath
//! reattempt timer. Tests substitute a recording interface and fire
//! expirations by hand.

use crate::status::Status;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Platform scheduling seam.
///
/// `start_timer` must arrange for `TimerManager::timer_expired(timer_id)`
/// to be invoked once the duration elapses, unless the timer is cancelled
/// first.
pub trait TimerInterface: Send + Sync {
    fn start_timer(&self, timer_id: i32, duration: Duration) -> Result<(), Status>;
    fn cancel_timer(&self, timer_id: i32);
}

struct TimerManagerInner {
    next_id: i32,
    pending: HashMap<i32, Box<dyn FnOnce() + Send>>,
}

/// Issues correlation ids for timers and routes expirations to the
/// parked callbacks.
pub struct TimerManager {
    interface: Arc<dyn TimerInterface>,
    inner: Mutex<TimerManagerInner>,
}

impl TimerManager {
    pub fn new(interface: Arc<dyn TimerInterface>) -> Self {
        Self {
            interface,
            inner: Mutex::new(TimerManagerInner {
                next_id: 0,
                pending: HashMap::new(),
            }),
        }
    }

    /// Arm a timer. Returns the correlation id on success.
    ///
    /// The callback runs at most once, when the interface reports expiry.
    pub fn start_timer(
        &self,
        callback: impl FnOnce() + Send + 'static,
        duration: Duration,
    ) -> Result<i32, Status> {
        let timer_id = {
            let mut inner = self.inner.lock().expect("timer manager lock poisoned");
            let id = inner.next_id;
            inner.next_id += 1;
            inner.pending.insert(id, Box::new(callback));
            id
        };

        if let Err(status) = self.interface.start_timer(timer_id, duration) {
            self.inner
                .lock()
                .expect("timer manager lock poisoned")
                .pending
                .remove(&timer_id);
            warn!(timer_id, %status, "Failed to start timer");
            return Err(status);
        }

        debug!(timer_id, duration_ms = duration.as_millis() as u64, "Timer started");
        Ok(timer_id)
    }

    /// Cancel an armed timer. No-op for unknown or already expired ids.
    pub fn cancel_timer(&self, timer_id: i32) {
        let removed = self
            .inner
            .lock()
            .expect("timer manager lock poisoned")
            .pending
            .remove(&timer_id)
            .is_some();
        if removed {
            self.interface.cancel_timer(timer_id);
            debug!(timer_id, "Timer cancelled");
        }
    }

    /// Deliver an expiry from the interface. Runs the parked callback.
    pub fn timer_expired(&self, timer_id: i32) {
        let callback = self
            .inner
            .lock()
            .expect("timer manager lock poisoned")
            .pending
            .remove(&timer_id);
        match callback {
            Some(callback) => callback(),
            None => debug!(timer_id, "Expiry for cancelled or unknown timer"),
        }
    }

    /// Number of armed timers.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("timer manager lock poisoned")
            .pending
            .len()
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Production `TimerInterface` backed by sleeping threads.
///
/// Each armed timer gets its own thread; cancellation is a shared set
/// checked at wakeup. Call [`ThreadTimer::attach`] once the manager
/// exists so expirations can be routed back.
pub struct ThreadTimer {
    manager: Mutex<Weak<TimerManager>>,
    cancelled: Arc<Mutex<HashSet<i32>>>,
}

impl ThreadTimer {
    pub fn new() -> Self {
        Self {
            manager: Mutex::new(Weak::new()),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Wire the expiry route back to the owning manager.
    pub fn attach(&self, manager: &Arc<TimerManager>) {
        *self.manager.lock().expect("thread timer lock poisoned") = Arc::downgrade(manager);
    }
}

impl Default for ThreadTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerInterface for ThreadTimer {
    fn start_timer(&self, timer_id: i32, duration: Duration) -> Result<(), Status> {
        let manager = self
            .manager
            .lock()
            .expect("thread timer lock poisoned")
            .clone();
        if manager.upgrade().is_none() {
            return Err(Status::failed_precondition(
                "timer interface not attached to a manager",
            ));
        }
        let cancelled = self.cancelled.clone();

        thread::Builder::new()
            .name(format!("krypton-timer-{}", timer_id))
            .spawn(move || {
                thread::sleep(duration);
                if cancelled
                    .lock()
                    .expect("thread timer lock poisoned")
                    .remove(&timer_id)
                {
                    return;
                }
                if let Some(manager) = manager.upgrade() {
                    manager.timer_expired(timer_id);
                }
            })
            .map_err(|e| Status::internal(format!("failed to spawn timer thread: {}", e)))?;

        Ok(())
    }

    fn cancel_timer(&self, timer_id: i32) {
        self.cancelled
            .lock()
            .expect("thread timer lock poisoned")
            .insert(timer_id);
    }
}
