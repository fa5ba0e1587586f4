use std::time::Duration;

const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_ERROR_BACKOFF: Duration = Duration::from_secs(8);

/// Timing policy of a consumer loop: how long each pop may block and how
/// long to pause after consecutive failures.
#[derive(Clone, Debug)]
pub struct PollSchedule {
    pop_timeout: Duration,
    error_backoff: Duration,
    max_error_backoff: Duration,
    consecutive_errors: u32,
}

impl PollSchedule {
    pub fn new(pop_timeout: Duration) -> Self {
        Self {
            pop_timeout,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            max_error_backoff: DEFAULT_MAX_ERROR_BACKOFF,
            consecutive_errors: 0,
        }
    }

    /// No blocking and no pauses; lets tests drive a loop cycle by cycle.
    pub fn immediate() -> Self {
        Self {
            pop_timeout: Duration::ZERO,
            error_backoff: Duration::ZERO,
            max_error_backoff: Duration::ZERO,
            consecutive_errors: 0,
        }
    }

    pub fn with_error_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.error_backoff = base;
        self.max_error_backoff = max;
        self
    }

    pub fn pop_timeout(&self) -> Duration {
        self.pop_timeout
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn on_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Records a failed cycle and returns the pause before the next one.
    pub fn on_error(&mut self) -> Duration {
        let exp = self.consecutive_errors.min(5);
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.error_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_error_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_backoff_grows_caps_and_resets() {
        let mut schedule = PollSchedule::new(Duration::from_secs(1));
        assert_eq!(schedule.on_error(), Duration::from_millis(500));
        assert_eq!(schedule.on_error(), Duration::from_millis(1_000));
        assert_eq!(schedule.on_error(), Duration::from_millis(2_000));
        for _ in 0..5 {
            schedule.on_error();
        }
        assert_eq!(schedule.on_error(), Duration::from_secs(8));

        schedule.on_success();
        assert_eq!(schedule.consecutive_errors(), 0);
        assert_eq!(schedule.on_error(), Duration::from_millis(500));
    }

    #[test]
    fn immediate_schedule_never_waits() {
        let mut schedule = PollSchedule::immediate();
        assert_eq!(schedule.pop_timeout(), Duration::ZERO);
        assert_eq!(schedule.on_error(), Duration::ZERO);
    }
}
