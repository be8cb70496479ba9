//! Token-bucket throttles and smoothed transfer rates.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bucket depth in seconds of traffic.
const BURST: f64 = 1.0;
/// Weight of the newest sample in the moving average.
const SMOOTHING: f64 = 0.5;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Caps throughput at `rate` bytes/s; 0 means unlimited.
#[derive(Debug)]
pub struct Throttle {
    rate: u64,
    bucket: Mutex<Bucket>,
}

impl Throttle {
    pub fn new(rate: u64) -> Self {
        Throttle {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate as f64 * BURST,
                last: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Takes `bytes` out of the bucket and returns how long the caller must
    /// wait before using them. The bucket may go negative.
    pub fn reserve(&self, bytes: usize, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let rate = self.rate as f64;
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.last = now.max(bucket.last);
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate * BURST);
        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }

    pub async fn acquire(&self, bytes: usize) {
        let wait = self.reserve(bytes, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Session-wide limits shared by every peer connection.
#[derive(Debug)]
pub struct Limits {
    pub download: Throttle,
    pub upload: Throttle,
}

impl Limits {
    pub fn new(download: u64, upload: u64) -> Self {
        Limits {
            download: Throttle::new(download),
            upload: Throttle::new(upload),
        }
    }
}

/// Turns a monotonically growing byte counter into bytes/s.
#[derive(Debug, Default)]
pub struct RateMeter {
    last: Option<(u64, Instant)>,
    rate: f64,
}

impl RateMeter {
    pub fn sample(&mut self, total: u64, now: Instant) -> f64 {
        if let Some((prev, at)) = self.last {
            let secs = now.saturating_duration_since(at).as_secs_f64();
            if secs > 0.0 {
                let instant = total.saturating_sub(prev) as f64 / secs;
                self.rate = SMOOTHING * instant + (1.0 - SMOOTHING) * self.rate;
            }
        }
        self.last = Some((total, now));
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_waits() {
        let t = Throttle::new(0);
        assert_eq!(t.reserve(usize::MAX / 2, Instant::now()), Duration::ZERO);
    }

    #[test]
    fn bucket_refills_over_time() {
        let t = Throttle::new(1000);
        let start = Instant::now();
        assert_eq!(t.reserve(1000, start), Duration::ZERO);
        assert_eq!(t.reserve(500, start), Duration::from_millis(500));
        // Half a second later the debt is paid off.
        let later = start + Duration::from_millis(500);
        assert_eq!(t.reserve(0, later), Duration::ZERO);
    }

    #[test]
    fn meter_smooths_samples() {
        let mut m = RateMeter::default();
        let t0 = Instant::now();
        assert_eq!(m.sample(0, t0), 0.0);
        assert_eq!(m.sample(1000, t0 + Duration::from_secs(1)), 500.0);
        assert_eq!(m.sample(2000, t0 + Duration::from_secs(2)), 750.0);
    }
}
