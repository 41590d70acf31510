//! Retransmission-timeout estimation.
//!
//! The first RTT sample replaces the initial guess wholesale; later samples
//! are folded in with an exponential moving average:
//!
//! RTO = 0.8 * RTO + 0.2 * sample
//!
//! Repeated timeouts without any ack double the estimate (clamped) so a bad
//! initial guess eventually adapts.

use std::time::Duration;

/// Initial RTO before any sample: 2 seconds.
pub const INITIAL_RTO_MICROS: i64 = 2_000_000;
/// Granularity floor: a measured RTT of ~zero must not collapse the
/// timeout to nothing.
const MIN_RTO_MICROS: i64 = 1_000;
/// Backoff ceiling: 20 seconds.
const MAX_BACKOFF_MICROS: i64 = 20_000_000;
/// Smoothing factor for the moving average.
const ALPHA: f64 = 0.8;

/// RTO estimator shared by the channel and stream layers.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    rto_micros: i64,
    first_sample: bool,
}

impl RtoEstimator {
    pub fn new() -> Self {
        Self {
            rto_micros: INITIAL_RTO_MICROS,
            first_sample: true,
        }
    }

    /// Fold in a measured round-trip time.
    pub fn sample(&mut self, rtt: Duration) {
        let rtt_micros = rtt.as_micros() as i64;
        if self.first_sample {
            self.rto_micros = rtt_micros;
            self.first_sample = false;
        } else {
            self.rto_micros =
                (ALPHA * self.rto_micros as f64 + (1.0 - ALPHA) * rtt_micros as f64) as i64;
        }
        self.rto_micros = self.rto_micros.max(MIN_RTO_MICROS);
    }

    /// Double the estimate after a timeout with no acks, up to the ceiling.
    pub fn backoff(&mut self) {
        if self.rto_micros < MAX_BACKOFF_MICROS {
            self.rto_micros *= 2;
        }
    }

    pub fn rto(&self) -> Duration {
        Duration::from_micros(self.rto_micros.max(0) as u64)
    }

    pub fn rto_micros(&self) -> i64 {
        self.rto_micros
    }
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_two_seconds() {
        let est = RtoEstimator::new();
        assert_eq!(est.rto(), Duration::from_secs(2));
    }

    #[test]
    fn first_sample_replaces_estimate() {
        let mut est = RtoEstimator::new();
        est.sample(Duration::from_millis(50));
        assert_eq!(est.rto(), Duration::from_millis(50));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut est = RtoEstimator::new();
        est.sample(Duration::from_micros(100_000));
        est.sample(Duration::from_micros(200_000));
        // 0.8 * 100000 + 0.2 * 200000 = 120000
        assert_eq!(est.rto_micros(), 120_000);
    }

    #[test]
    fn near_zero_samples_keep_a_floor() {
        let mut est = RtoEstimator::new();
        est.sample(Duration::ZERO);
        assert_eq!(est.rto(), Duration::from_millis(1));
    }

    #[test]
    fn backoff_doubles_until_clamped() {
        let mut est = RtoEstimator::new();
        est.sample(Duration::from_secs(6));
        est.backoff();
        assert_eq!(est.rto(), Duration::from_secs(12));
        est.backoff();
        assert_eq!(est.rto(), Duration::from_secs(24));
        // 24s exceeds the ceiling, so no further doubling.
        est.backoff();
        assert_eq!(est.rto(), Duration::from_secs(24));
    }
}
