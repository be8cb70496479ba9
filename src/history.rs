pub const RATE_HISTORY_CAPACITY: usize = 200;

/// Recent download-rate samples, oldest first.
///
/// The backing array is allocated once and never grows, so a transfer that
/// runs for days keeps the same footprint as one that runs for seconds.
#[derive(Debug, Clone)]
pub struct RateHistory {
    samples: [f64; RATE_HISTORY_CAPACITY],
    len: usize,
}

impl RateHistory {
    pub fn new() -> Self {
        RateHistory {
            samples: [0.0; RATE_HISTORY_CAPACITY],
            len: 0,
        }
    }

    /// Appends a sample, dropping the oldest one once full. Negative and NaN
    /// samples are stored as 0.
    pub fn push(&mut self, sample: f64) {
        let sample = sample.max(0.0);
        if self.len < RATE_HISTORY_CAPACITY {
            self.samples[self.len] = sample;
            self.len += 1;
        } else {
            self.samples.copy_within(1.., 0);
            self.samples[RATE_HISTORY_CAPACITY - 1] = sample;
        }
    }

    pub fn snapshot(&self) -> &[f64] {
        &self.samples[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for RateHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let h = RateHistory::new();
        assert!(h.is_empty());
        assert!(h.snapshot().is_empty());
        assert_eq!(h.snapshot().last().copied(), None);
    }

    #[test]
    fn below_capacity_never_evicts() {
        let mut h = RateHistory::new();
        for i in 0..150 {
            h.push(i as f64);
        }
        assert_eq!(h.len(), 150);
        assert_eq!(h.snapshot()[0], 0.0);
        assert_eq!(h.snapshot().last().copied(), Some(149.0));
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut h = RateHistory::new();
        for i in 1..=201 {
            h.push(i as f64);
        }
        assert_eq!(h.len(), RATE_HISTORY_CAPACITY);
        assert_eq!(h.snapshot()[0], 2.0);
        assert_eq!(h.snapshot().last().copied(), Some(201.0));
        assert!(h.snapshot().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn invalid_samples_are_zeroed() {
        let mut h = RateHistory::new();
        h.push(-3.0);
        h.push(f64::NAN);
        assert_eq!(h.snapshot(), &[0.0, 0.0]);
    }
}
