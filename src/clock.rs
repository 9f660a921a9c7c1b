use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

///
/// Source of wall-clock time, in seconds since the unix epoch.
///
/// Lock deadlines are absolute epoch seconds, so every process sharing a store must agree on
/// this clock within a small margin.
///
pub trait Clock: Send + Sync {
    fn now_epoch_secs(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

///
/// Clock that only moves when told to.
///
/// Clones share the same time, so a store and the locks using it can be driven together.
///
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_epoch_secs: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now_epoch_secs)),
        }
    }

    pub fn set(&self, now_epoch_secs: i64) {
        self.now.store(now_epoch_secs, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs() as i64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_epoch_secs(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(100);
        let other = clock.clone();
        clock.advance(Duration::from_secs(3));
        assert_eq!(other.now_epoch_secs(), 103);
        other.set(7);
        assert_eq!(clock.now_epoch_secs(), 7);
    }
}
