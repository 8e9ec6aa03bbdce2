//! RTT estimation: `min_rtt`, `srtt`, `rttvar`, `latest_rtt` maintained as
//! exponentially weighted moving averages.

use std::time::Duration;

use super::{K_GRANULARITY, K_INITIAL_RTT};

#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    min: Duration,
    smoothed: Duration,
    var: Duration,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            latest: K_INITIAL_RTT,
            min: Duration::MAX,
            smoothed: K_INITIAL_RTT,
            var: K_INITIAL_RTT / 2,
            has_sample: false,
        }
    }
}

impl RttEstimator {
    /// Feed a new sample.
    ///
    /// `ack_delay` is the peer-reported delay, already scaled by its
    /// ack-delay exponent and clamped to its `max_ack_delay`; it is
    /// subtracted from the sample when the difference stays positive.
    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest = sample;
        self.min = self.min.min(sample);

        let adjusted = match sample.checked_sub(ack_delay) {
            Some(adj) if !adj.is_zero() => adj,
            _ => sample,
        };

        if !self.has_sample {
            self.smoothed = adjusted;
            self.var = adjusted / 2;
            self.has_sample = true;
        } else {
            let var_sample = if self.smoothed > adjusted {
                self.smoothed - adjusted
            } else {
                adjusted - self.smoothed
            };
            self.var = self.var * 3 / 4 + var_sample / 4;
            self.smoothed = self.smoothed * 7 / 8 + adjusted / 8;
        }
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    pub fn min(&self) -> Duration {
        if self.min == Duration::MAX {
            K_INITIAL_RTT
        } else {
            self.min
        }
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    pub fn var(&self) -> Duration {
        self.var
    }

    /// Base probe timeout: `srtt + max(4*rttvar, kGranularity) +
    /// max_ack_delay`, before exponential backoff.
    pub fn pto_base(&self, max_ack_delay: Duration) -> Duration {
        self.smoothed + (self.var * 4).max(K_GRANULARITY) + max_ack_delay
    }

    /// Time before which an unacked packet is deemed lost:
    /// `max(kGranularity, 9/8 * max(srtt, latest_rtt))`.
    pub fn loss_delay(&self) -> Duration {
        (self.smoothed.max(self.latest) * 9 / 8).max(K_GRANULARITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_averages() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        assert_eq!(rtt.smoothed(), Duration::from_millis(100));
        assert_eq!(rtt.var(), Duration::from_millis(50));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn subsequent_samples_are_smoothed() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(180), Duration::ZERO);
        // srtt = 7/8*100 + 1/8*180 = 110ms
        assert_eq!(rtt.smoothed(), Duration::from_millis(110));
        // rttvar = 3/4*50 + 1/4*80 = 57.5ms
        assert_eq!(rtt.var(), Duration::from_micros(57_500));
        assert_eq!(rtt.latest(), Duration::from_millis(180));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn ack_delay_is_subtracted_only_while_positive() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(120), Duration::from_millis(20));
        // adjusted sample is 100ms: srtt stays flat
        assert_eq!(rtt.smoothed(), Duration::from_millis(100));

        // A delay larger than the sample is ignored.
        rtt.update(Duration::from_millis(10), Duration::from_millis(50));
        assert!(rtt.smoothed() < Duration::from_millis(100));
        assert_eq!(rtt.min(), Duration::from_millis(10));
    }

    #[test]
    fn loss_delay_is_nine_eighths_of_the_larger_rtt() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(80), Duration::ZERO);
        rtt.update(Duration::from_millis(160), Duration::ZERO);
        // latest (160) > srtt (90): 160 * 9/8 = 180ms
        assert_eq!(rtt.loss_delay(), Duration::from_millis(180));
    }

    #[test]
    fn pto_base_floors_the_variance_term() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        let pto = rtt.pto_base(Duration::from_millis(25));
        assert!(pto >= rtt.smoothed() + K_GRANULARITY + Duration::from_millis(25));
    }
}
