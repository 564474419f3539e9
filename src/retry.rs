/// Retry schedule for pending requests.
///
/// Tracks the remaining attempt budget and the current interval. With
/// drop-off enabled the interval doubles after each retransmission,
/// capped at `max_interval`. Without it the interval stays constant.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetrySchedule {
    interval: Duration,
    max_interval: Option<Duration>,
    drop_off: bool,
    remaining: u32,
}

impl RetrySchedule {
    pub fn new(
        interval: Duration,
        remaining: u32,
        drop_off: bool,
        max_interval: Option<Duration>,
    ) -> Self {
        Self {
            interval,
            max_interval,
            drop_off,
            remaining,
        }
    }

    /// The interval until the next deadline.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Consumes one retry. Returns the interval to wait before the
    /// following deadline, or None when the budget is exhausted.
    pub fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        if self.drop_off {
            let doubled = self.interval.saturating_mul(2);
            self.interval = match self.max_interval {
                Some(max) => doubled.min(max),
                None => doubled,
            };
        }
        Some(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_without_drop_off() {
        let mut schedule =
            RetrySchedule::new(Duration::from_secs(1), 3, false, None);
        assert_eq!(schedule.next(), Some(Duration::from_secs(1)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(1)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(1)));
        assert_eq!(schedule.next(), None);
    }

    #[test]
    fn test_doubling_with_drop_off() {
        let mut schedule =
            RetrySchedule::new(Duration::from_secs(2), 4, true, None);
        assert_eq!(schedule.next(), Some(Duration::from_secs(4)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(8)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(16)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(32)));
        assert_eq!(schedule.next(), None);
    }

    #[test]
    fn test_ceiling() {
        let mut schedule = RetrySchedule::new(
            Duration::from_secs(2),
            5,
            true,
            Some(Duration::from_secs(10)),
        );
        assert_eq!(schedule.next(), Some(Duration::from_secs(4)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(8)));
        // 8 * 2 = 16, capped at 10
        assert_eq!(schedule.next(), Some(Duration::from_secs(10)));
        assert_eq!(schedule.next(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_intervals_non_decreasing() {
        let mut schedule = RetrySchedule::new(
            Duration::from_millis(500),
            20,
            true,
            Some(Duration::from_secs(3600)),
        );
        let mut last = schedule.interval();
        while let Some(next) = schedule.next() {
            assert!(next >= last);
            assert!(next <= Duration::from_secs(3600));
            last = next;
        }
    }

    #[test]
    fn test_zero_budget_exhausted_immediately() {
        let mut schedule = RetrySchedule::new(Duration::from_secs(1), 0, true, None);
        assert_eq!(schedule.next(), None);
    }
}
