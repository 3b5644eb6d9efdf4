//! Time seams for the orchestration core.
//!
//! Components never reach for `Instant::now` or `tokio::time::sleep`
//! directly; readings go through [`Clock`] and waits through [`Sleeper`].
//! Production wiring uses [`WallTime`] for both. Tests use [`VirtualTime`],
//! where nothing moves unless the test says so and sleeping jumps the clock
//! forward instead of waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Monotonic milliseconds. The origin is arbitrary but fixed, so readings
/// are only meaningful as differences.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Async waiting.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

fn process_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Real time: monotonic readings against one process-wide origin, waits on
/// the tokio timer. Zero-sized, so every component can carry its own copy
/// and all of them agree on what time it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallTime;

impl Clock for WallTime {
    fn now_millis(&self) -> u64 {
        process_origin().elapsed().as_millis() as u64
    }
}

#[async_trait]
impl Sleeper for WallTime {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual time for tests. `advance`/`set` move the clock by hand; `sleep`
/// returns immediately after jumping the clock by the requested amount and
/// appending it to a log the test can assert on. Clones share state, so the
/// component under test and the assertions see the same timeline.
#[derive(Debug, Clone, Default)]
pub struct VirtualTime {
    now: Arc<AtomicU64>,
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl VirtualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Every delay requested through [`Sleeper::sleep`], in order.
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Clock for VirtualTime {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sleeper for VirtualTime {
    async fn sleep(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        self.slept
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_time_never_goes_backwards() {
        let clock = WallTime;
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
    }

    #[test]
    fn wall_time_copies_share_one_origin() {
        let first = WallTime.now_millis();
        std::thread::sleep(Duration::from_millis(5));
        let second = WallTime.now_millis();
        assert!(second >= first + 4, "separate copies must read the same timeline");
    }

    #[test]
    fn virtual_time_moves_only_on_demand() {
        let time = VirtualTime::new();
        assert_eq!(time.now_millis(), 0);
        time.advance(150);
        assert_eq!(time.now_millis(), 150);
        time.set(42);
        assert_eq!(time.now_millis(), 42);
    }

    #[tokio::test]
    async fn sleeping_on_virtual_time_jumps_the_clock() {
        let time = VirtualTime::new();
        let start = Instant::now();
        time.sleep(Duration::from_secs(3600)).await;
        assert!(start.elapsed() < Duration::from_millis(100), "must not actually wait");
        assert_eq!(time.now_millis(), 3_600_000);
        assert_eq!(time.slept(), vec![Duration::from_secs(3600)]);
    }

    #[tokio::test]
    async fn clones_share_the_timeline_and_the_sleep_log() {
        let time = VirtualTime::new();
        let clone = time.clone();

        clone.advance(100);
        assert_eq!(time.now_millis(), 100);

        clone.sleep(Duration::from_millis(40)).await;
        time.sleep(Duration::from_millis(60)).await;
        assert_eq!(time.now_millis(), 200);
        assert_eq!(
            time.slept(),
            vec![Duration::from_millis(40), Duration::from_millis(60)]
        );
    }

    #[tokio::test]
    async fn seams_work_behind_trait_objects() {
        let time = VirtualTime::new();
        let clock: Arc<dyn Clock> = Arc::new(time.clone());
        let sleeper: Arc<dyn Sleeper> = Arc::new(time);

        sleeper.sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now_millis(), 250);
    }
}
