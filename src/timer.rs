use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// One-shot cancellable timer.
///
/// Arming the timer schedules its callback to run once, after the configured
/// interval, on a task thread parked on a condition variable. `cancel`
/// disarms a pending task; `restart` disarms and schedules afresh, optionally
/// with a new interval. The callback receives a handle to the timer so it can
/// reschedule itself; state it needs beyond that travels in whatever shared
/// handles the closure captured.
///
/// A task that has already committed to firing runs its callback to
/// completion even if `cancel` races with the expiry; the callback is
/// expected to check protocol state and bail out when there is nothing left
/// to do.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<Inner>,
}

struct Inner {
    callback: Box<dyn Fn(&Timer) + Send + Sync>,
    state: Mutex<TimerState>,
    cond: Condvar,
}

struct TimerState {
    interval: Duration,
    // Bumped on every cancel/restart so superseded tasks know to exit.
    epoch: u64,
    armed: bool,
}

impl Timer {
    pub fn new<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        Timer {
            inner: Arc::new(Inner {
                callback: Box::new(callback),
                state: Mutex::new(TimerState {
                    interval,
                    epoch: 0,
                    armed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Arms the timer with its current interval. Does nothing (but warns)
    /// when a task is already pending.
    pub fn start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.armed {
            warn!("timer already running");
            return;
        }
        state.armed = true;
        state.epoch += 1;
        let (epoch, interval) = (state.epoch, state.interval);
        drop(state);

        debug!(?interval, "timer started");
        self.arm(epoch, interval);
    }

    pub fn is_alive(&self) -> bool {
        self.inner.state.lock().unwrap().armed
    }

    /// Disarms any pending task. A callback already past the point of no
    /// return still runs.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.armed = false;
        state.epoch += 1;
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Cancels any pending task and schedules a new one, with `new_interval`
    /// if given, otherwise with the interval used last.
    pub fn restart(&self, new_interval: Option<Duration>) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(interval) = new_interval {
            state.interval = interval;
        }
        state.armed = true;
        state.epoch += 1;
        let (epoch, interval) = (state.epoch, state.interval);
        drop(state);
        self.inner.cond.notify_all();

        self.arm(epoch, interval);
    }

    pub fn interval(&self) -> Duration {
        self.inner.state.lock().unwrap().interval
    }

    fn arm(&self, epoch: u64, interval: Duration) {
        let timer = self.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + interval;
            let mut state = timer.inner.state.lock().unwrap();
            loop {
                if !state.armed || state.epoch != epoch {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = timer
                    .inner
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap();
                state = guard;
            }
            // Committed: from here on a racing cancel no longer stops us.
            state.armed = false;
            drop(state);

            (timer.inner.callback)(&timer);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_timer(interval: Duration) -> (Timer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = fired.clone();
            Timer::new(interval, move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        (timer, fired)
    }

    #[test]
    fn fires_once_after_the_interval() {
        let (timer, fired) = counting_timer(Duration::from_millis(20));
        timer.start();
        assert!(timer.is_alive());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_alive());
    }

    #[test]
    fn cancel_prevents_the_callback() {
        let (timer, fired) = counting_timer(Duration::from_millis(50));
        timer.start();
        timer.cancel();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_alive());
    }

    #[test]
    fn restart_defers_the_expiry() {
        let (timer, fired) = counting_timer(Duration::from_millis(100));
        timer.start();
        thread::sleep(Duration::from_millis(60));
        timer.restart(None);
        thread::sleep(Duration::from_millis(60));
        // The original deadline has passed but the restarted one has not.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restart_adopts_a_new_interval() {
        let (timer, fired) = counting_timer(Duration::from_secs(5));
        timer.start();
        timer.restart(Some(Duration::from_millis(20)));
        assert_eq!(timer.interval(), Duration::from_millis(20));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_can_rearm_through_its_handle() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = fired.clone();
            Timer::new(Duration::from_millis(10), move |timer| {
                if fired.fetch_add(1, Ordering::SeqCst) == 0 {
                    timer.restart(None);
                }
            })
        };
        timer.start();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
