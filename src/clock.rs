use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Wall-clock time and cancellable delay behind one seam so that selector,
/// ledger, and dispatcher timing can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    /// Current wall-clock time as epoch milliseconds.
    fn now_ms(&self) -> u64;

    /// Suspend for the given duration. Cancellation-safe: dropping the
    /// future abandons the wait.
    fn sleep(&self, duration: Duration) -> BoxFuture<'_>;
}

/// Production clock: `SystemTime` + `tokio::time::sleep`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}
