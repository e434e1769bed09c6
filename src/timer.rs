//! Deferred callbacks for the grouping window.

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

pub trait Timer: Send + Sync + fmt::Debug {
    /// Runs `callback` once after `delay`, unless the timer is shut down first.
    fn schedule(&self, delay: Duration, callback: Callback);

    /// Drops every callback that has not fired yet.
    fn shutdown(&self);
}

/// Timer backed by the tokio runtime. Must be used from within a runtime.
#[derive(Debug, Default)]
pub struct TokioTimer {
    token: CancellationToken,
}

impl TokioTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: Callback) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("Timer cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => callback(),
            }
        });
    }

    fn shutdown(&self) {
        self.token.cancel();
    }
}

struct Scheduled {
    due: Duration,
    callback: Callback,
}

/// Virtual clock. Callbacks fire only when the clock is advanced past them.
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    scheduled: Vec<Scheduled>,
    shut_down: bool,
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualTimer")
            .field("now", &state.now)
            .field("pending", &state.scheduled.len())
            .finish()
    }
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    /// Moves the clock forward and runs every callback that became due, in
    /// due order.
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.now += by;
            let now = state.now;
            let (mut due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
                .into_iter()
                .partition(|scheduled| scheduled.due <= now);
            state.scheduled = waiting;
            due.sort_by_key(|scheduled| scheduled.due);
            due
        };

        // Callbacks may schedule again, so the lock is released first
        for scheduled in due {
            (scheduled.callback)();
        }
    }

    /// Runs every pending callback regardless of its due time.
    pub fn fire_all(&self) {
        let latest = {
            let state = self.state.lock();
            state
                .scheduled
                .iter()
                .map(|scheduled| scheduled.due)
                .max()
                .map(|due| due.saturating_sub(state.now))
        };
        if let Some(remaining) = latest {
            self.advance(remaining);
        }
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, callback: Callback) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        let due = state.now + delay;
        state.scheduled.push(Scheduled { due, callback });
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        state.scheduled.clear();
    }
}
