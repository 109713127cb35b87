use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;
const GAMMA: f64 = 2.0;

/// Jacobson/Karels round-trip estimator.
///
/// Tracks a smoothed RTT and its deviation and derives the retransmission
/// timeout from them. While a timeout streak is in progress the interval
/// doubles on every [`backoff`](Self::backoff) instead; the next genuine
/// sample recomputes it from the smoothed values.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    est_rtt: f64,
    dev_rtt: f64,
    interval: f64,
    within_timeout: bool,
}

impl RttEstimator {
    pub fn new(init: Duration) -> Self {
        let init = init.as_secs_f64();
        RttEstimator {
            est_rtt: init,
            dev_rtt: 0.0,
            interval: init,
            within_timeout: false,
        }
    }

    /// Feeds one round-trip measurement taken from a segment that was never
    /// retransmitted, ending any timeout streak.
    pub fn sample(&mut self, rtt: Duration) {
        self.within_timeout = false;

        let r = rtt.as_secs_f64();
        self.est_rtt = (1.0 - ALPHA) * self.est_rtt + ALPHA * r;
        self.dev_rtt = (1.0 - BETA) * self.dev_rtt + BETA * (r - self.est_rtt).abs();
        self.interval = round_ms(self.est_rtt + GAMMA * self.dev_rtt);
    }

    /// Doubles the timeout after an expiry. Repeated expiries keep doubling
    /// until [`sample`](Self::sample) restores the computed interval.
    pub fn backoff(&mut self) {
        self.within_timeout = true;
        self.interval *= 2.0;
    }

    /// The current retransmission timeout.
    pub fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    pub fn is_backed_off(&self) -> bool {
        self.within_timeout
    }
}

// The timeout is kept at millisecond precision.
fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_the_initial_timeout() {
        let est = RttEstimator::new(Duration::from_secs(1));
        assert_eq!(est.rto(), Duration::from_secs(1));
        assert!(!est.is_backed_off());
    }

    #[test]
    fn sample_equal_to_estimate_keeps_the_interval() {
        let mut est = RttEstimator::new(Duration::from_secs(1));
        est.sample(Duration::from_secs(1));
        assert_eq!(est.rto(), Duration::from_secs(1));
    }

    #[test]
    fn sample_follows_jacobson_karels() {
        let mut est = RttEstimator::new(Duration::from_secs(1));
        est.sample(Duration::from_millis(500));
        // est = 0.875*1.0 + 0.125*0.5 = 0.9375
        // dev = 0.75*0 + 0.25*|0.5 - 0.9375| = 0.109375
        // rto = round(0.9375 + 2*0.109375) = 1.156
        assert_eq!(est.rto().as_millis(), 1156);
    }

    #[test]
    fn backoff_doubles_and_compounds() {
        let mut est = RttEstimator::new(Duration::from_secs(1));
        est.backoff();
        assert!(est.is_backed_off());
        assert_eq!(est.rto(), Duration::from_secs(2));
        est.backoff();
        assert_eq!(est.rto(), Duration::from_secs(4));
    }

    #[test]
    fn sample_clears_a_timeout_streak() {
        let mut est = RttEstimator::new(Duration::from_secs(1));
        est.backoff();
        est.backoff();
        est.sample(Duration::from_secs(1));
        assert!(!est.is_backed_off());
        // Recomputed from the smoothed values, not from the doubled interval.
        assert_eq!(est.rto(), Duration::from_secs(1));
    }
}
