//! Time as an explicit collaborator.
//!
//! Every loop that looks at the wall clock or sleeps does so through
//! [`Clock`], so tests can drive time by hand instead of racing timers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current Unix time, in seconds.
    fn now(&self) -> i64;

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// The real clock, backed by tokio timers.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A hand-driven clock for tests: `sleep` advances time and resolves
/// immediately.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn at(now: i64) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.now.fetch_add(duration.as_secs() as i64, Ordering::SeqCst);
        Box::pin(tokio::task::yield_now())
    }
}
