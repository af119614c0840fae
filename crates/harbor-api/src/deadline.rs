use std::time::Duration;

pub const DEFAULT_DEADLINE_SECS: f64 = 5.0;
pub const MAX_DEADLINE_SECS: f64 = 60.0;

/// Bounds applied to caller-requested deadlines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadlinePolicy {
    default: Duration,
    max: Duration,
}

impl DeadlinePolicy {
    /// Build a policy from seconds. `default` is clamped into `max`.
    pub fn new(default_secs: f64, max_secs: f64) -> Self {
        let max = positive_secs(max_secs).unwrap_or(Duration::from_secs_f64(MAX_DEADLINE_SECS));
        let default = positive_secs(default_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_DEADLINE_SECS))
            .min(max);
        Self { default, max }
    }

    pub fn default_deadline(&self) -> Duration {
        self.default
    }

    pub fn max_deadline(&self) -> Duration {
        self.max
    }

    /// The deadline a call actually gets.
    ///
    /// Missing, non-finite and non-positive requests fall back to the
    /// default; anything above the maximum is capped.
    pub fn resolve(&self, requested_secs: Option<f64>) -> Duration {
        match requested_secs.and_then(positive_secs) {
            Some(d) => d.min(self.max),
            None => self.default,
        }
    }
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DEADLINE_SECS, MAX_DEADLINE_SECS)
    }
}

fn positive_secs(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Render a deadline the way the wire header carries it.
pub fn header_value(deadline: Duration) -> String {
    format!("{}", deadline.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_deadline_gets_default() {
        let policy = DeadlinePolicy::default();
        assert_eq!(policy.resolve(None), Duration::from_secs(5));
    }

    #[test]
    fn oversized_deadline_is_capped() {
        let policy = DeadlinePolicy::new(5.0, 60.0);
        assert_eq!(policy.resolve(Some(600.0)), Duration::from_secs(60));
    }

    #[test]
    fn fractional_deadline_is_kept() {
        let policy = DeadlinePolicy::default();
        assert_eq!(policy.resolve(Some(0.001)), Duration::from_millis(1));
    }

    #[test]
    fn nonsense_deadline_falls_back() {
        let policy = DeadlinePolicy::default();
        assert_eq!(policy.resolve(Some(f64::NAN)), policy.default_deadline());
        assert_eq!(policy.resolve(Some(-3.0)), policy.default_deadline());
        assert_eq!(policy.resolve(Some(0.0)), policy.default_deadline());
    }

    #[test]
    fn default_never_exceeds_max() {
        let policy = DeadlinePolicy::new(120.0, 30.0);
        assert_eq!(policy.default_deadline(), Duration::from_secs(30));
    }

    #[test]
    fn header_is_seconds() {
        assert_eq!(header_value(Duration::from_secs(60)), "60");
        assert_eq!(header_value(Duration::from_millis(1500)), "1.5");
    }
}
