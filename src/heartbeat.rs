//! Periodic token status checks with suspension detection.
//!
//! Webview-style hosts freeze timers while backgrounded. Each tick
//! measures the wall-clock gap since the previous one; a gap beyond twice
//! the interval is logged as a suspected suspension and the check still
//! runs, so a resumed instance reconciles immediately instead of drifting.
//! Monotonic clocks stand still across an OS suspend, so the gap has to
//! come from the wall clock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::machine::now_ms;

type TickFn = Arc<dyn Fn() + Send + Sync>;

/// Periodic runner for token status checks.
///
/// The callback must not block; spawn a task for async work. Callback
/// panics are not caught here.
pub struct Heartbeat {
    interval: Duration,
    last_tick_ms: Arc<Mutex<i64>>,
    task: Mutex<Option<JoinHandle<()>>>,
    tick: TickFn,
}

impl Heartbeat {
    pub fn new(interval: Duration, tick: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            interval,
            last_tick_ms: Arc::new(Mutex::new(now_ms())),
            task: Mutex::new(None),
            tick: Arc::new(tick),
        }
    }

    /// Run the callback now and start the periodic task.
    ///
    /// Restarts the timer if already running. Must be called within a
    /// tokio runtime.
    pub fn start(&self) {
        self.stop();

        *lock(&self.last_tick_ms) = now_ms();
        (self.tick)();

        let interval = self.interval;
        let interval_ms = interval.as_millis() as i64;
        let last_tick_ms = Arc::clone(&self.last_tick_ms);
        let tick = Arc::clone(&self.tick);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                timer.tick().await;

                let gap_ms = {
                    let mut last = lock(&last_tick_ms);
                    let now = now_ms();
                    let gap = now.saturating_sub(*last);
                    *last = now;
                    gap
                };
                if gap_ms > interval_ms.saturating_mul(2) {
                    warn!(
                        gap_ms,
                        interval_ms,
                        "Heartbeat gap exceeds twice the interval; host was likely suspended"
                    );
                }

                tick();
            }
        });
        *lock(&self.task) = Some(handle);
        debug!(interval_ms = self.interval.as_millis() as u64, "Heartbeat started");
    }

    /// Abort the periodic task. The callback is never invoked again until
    /// the next `start`.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
            debug!("Heartbeat stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Run one check immediately without touching the schedule.
    pub fn trigger_now(&self) {
        *lock(&self.last_tick_ms) = now_ms();
        (self.tick)();
    }

    /// Wall-clock time since the last tick (or construction, before the
    /// first one).
    pub fn time_since_last_tick(&self) -> Duration {
        let elapsed = now_ms().saturating_sub(*lock(&self.last_tick_ms));
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
