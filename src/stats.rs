use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Byte counter for one sub-test data channel
pub struct TransferStats {
    bytes: AtomicU64,
    start_time: Instant,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average rate since the counter was created, in kilobits per second
    pub fn rate_kbps(&self) -> f64 {
        rate_kbps(self.total_bytes(), self.elapsed())
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Kilobits per second for `bytes` moved over `elapsed`
pub fn rate_kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 * 8.0) / (secs * 1000.0)
    } else {
        0.0
    }
}
