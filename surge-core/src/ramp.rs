use std::time::Duration;

/// Linear ramp-up: user `i` of `users` starts at `duration * i / users`.
#[derive(Debug, Clone, Copy)]
pub struct RampUp {
    users: u64,
    duration: Duration,
}

impl RampUp {
    pub fn new(users: u64, duration: Duration) -> Self {
        Self { users, duration }
    }

    /// Start offset of user `index` (0-based) relative to the group start.
    pub fn start_offset(&self, index: u64) -> Duration {
        if self.users == 0 || self.duration.is_zero() {
            return Duration::ZERO;
        }

        let num = self.duration.as_nanos() as i128 * index.min(self.users) as i128;
        let den = self.users as i128;
        let nanos = (num / den).clamp(0, u64::MAX as i128) as u64;
        Duration::from_nanos(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_linear() {
        let ramp = RampUp::new(4, Duration::from_secs(2));
        let offsets: Vec<Duration> = (0..4).map(|i| ramp.start_offset(i)).collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_millis(1500),
            ]
        );
    }

    #[test]
    fn zero_ramp_starts_everyone_at_once() {
        let ramp = RampUp::new(5, Duration::ZERO);
        assert!((0..5).all(|i| ramp.start_offset(i).is_zero()));
    }
}
