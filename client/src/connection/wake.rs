// Wake-from-sleep detection by wall-clock drift
// A monotonic ticker stalls while the host sleeps; the wall clock does not

use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::info;

pub const WAKE_TICK: Duration = Duration::from_secs(10);

/// Allowed lateness of a tick before it counts as sleep
pub const WAKE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WakeClock {
    tick: Duration,
    grace: Duration,
    last: SystemTime,
}

impl WakeClock {
    pub fn new(tick: Duration, grace: Duration, now: SystemTime) -> Self {
        Self { tick, grace, last: now }
    }

    /// Feed the wall clock at each tick; returns how long the host slept, if it did
    pub fn observe(&mut self, now: SystemTime) -> Option<Duration> {
        // A clock set backwards reads as no time passed
        let elapsed = now.duration_since(self.last).unwrap_or_default();
        self.last = now;

        if elapsed > self.tick + self.grace {
            Some(elapsed - self.tick)
        } else {
            None
        }
    }
}

/// Run the drift loop until the task is aborted; `on_wake` gets the slept duration
pub fn spawn_wake_detector<F>(on_wake: F) -> JoinHandle<()>
where
    F: Fn(Duration) + Send + 'static,
{
    tokio::spawn(async move {
        let mut clock = WakeClock::new(WAKE_TICK, WAKE_GRACE, SystemTime::now());
        let mut ticker = tokio::time::interval(WAKE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Some(slept) = clock.observe(SystemTime::now()) {
                info!(slept_secs = slept.as_secs(), "host woke from sleep");
                on_wake(slept);
            }
        }
    })
}
