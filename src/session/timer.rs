//! Idle supervision
//!
//! An [`ActivityTimer`] watches one relay (or direction pair): absence of
//! an activity signal for the whole timeout is treated as proof of death
//! and fires the inactive callback exactly once. Construction records one
//! activity tick so a zero-traffic handshake starts with the full
//! allowance instead of being flagged immediately.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct TimerInner {
    /// Last observed activity and the current allowance
    window: Mutex<(Instant, Duration)>,
    /// Wakes the run loop when the allowance changes
    rearm: Notify,
    cancel: CancellationToken,
    fired: AtomicBool,
    on_idle: Box<dyn Fn() + Send + Sync>,
}

impl TimerInner {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            (self.on_idle)();
        }
    }
}

/// One-shot idle timer bound to a relay direction pair
pub struct ActivityTimer {
    inner: Arc<TimerInner>,
}

impl ActivityTimer {
    /// Arm the timer. The callback runs at most once, on the timer task.
    pub fn new<F>(timeout: Duration, on_idle: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = Arc::new(TimerInner {
            window: Mutex::new((Instant::now(), timeout)),
            rearm: Notify::new(),
            cancel: CancellationToken::new(),
            fired: AtomicBool::new(false),
            on_idle: Box::new(on_idle),
        });

        let task = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let (last, timeout) = *task.window.lock();
                    last + timeout
                };
                if Instant::now() >= deadline {
                    task.fire();
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        // Re-check: an update may have pushed the deadline
                        let (last, timeout) = *task.window.lock();
                        if Instant::now() >= last + timeout {
                            task.fire();
                            return;
                        }
                    }
                    _ = task.rearm.notified() => {}
                    _ = task.cancel.cancelled() => return,
                }
            }
        });

        Self { inner }
    }

    /// Record activity, pushing the deadline forward
    pub fn update(&self) {
        self.inner.window.lock().0 = Instant::now();
    }

    /// Re-arm with a new allowance, counting from now. Zero expresses "no
    /// further idle allowance" and fires immediately.
    pub fn set_timeout(&self, timeout: Duration) {
        {
            let mut window = self.inner.window.lock();
            *window = (Instant::now(), timeout);
        }
        self.inner.rearm.notify_one();
    }

    /// Disarm without invoking the callback
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Invoke the callback (at most once) and disarm
    pub fn finish(&self) {
        self.inner.fire();
        self.inner.cancel.cancel();
    }

    /// Whether the inactive callback has run
    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// A hook that records activity on this timer, for the relay loops
    pub fn activity_hook(&self) -> impl Fn() + Send + Sync + 'static {
        let inner = Arc::clone(&self.inner);
        move || {
            inner.window.lock().0 = Instant::now();
        }
    }
}

impl Drop for ActivityTimer {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
