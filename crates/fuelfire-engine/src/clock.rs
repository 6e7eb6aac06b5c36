use std::{
    thread,
    time::{Duration, SystemTime},
};

/// Time source and blocking wait used by every poll loop.
///
/// Wall-clock based because staleness is judged against file modification
/// times.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    fn sleep(&self, duration: Duration);

    /// Time since `earlier`, zero if `earlier` lies in the future.
    fn since(&self, earlier: SystemTime) -> Duration {
        self.now()
            .duration_since(earlier)
            .unwrap_or(Duration::ZERO)
    }
}

/// Real clock backed by `SystemTime::now` and `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
