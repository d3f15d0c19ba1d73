//! Arrival schedules for the open concurrency model.
//!
//! A schedule is written as a whitespace separated list of phases, for example
//! `rate(50/sec) random_arrivals(100ms) pause(2s)`, and is evaluated left to right.

mod parse;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use parse::{ParseErrorKind, ScheduleParseError, parse_duration, parse_schedule};

/// One step of an arrival schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// Deterministic arrivals every `1 / rate_per_second`.
    ///
    /// Without `duration` or `max_arrivals` the phase only sets the current rate for the
    /// phases that follow it, unless it is the last phase, in which case it never ends.
    RateArrival {
        rate_per_second: f64,
        duration: Option<Duration>,
        max_arrivals: Option<u64>,
    },

    /// Randomly placed arrivals; `window` bounds the spacing of the random draws.
    RandomArrival {
        window: Duration,
        duration: Option<Duration>,
    },

    /// Evenly spaced arrivals at the current rate for `duration`.
    EvenArrival { duration: Duration },

    /// No arrivals for `duration`.
    Pause { duration: Duration },
}

impl Phase {
    /// Wall-clock length of the phase, if it is bounded on its own.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::RateArrival { duration, .. } => *duration,
            Self::RandomArrival { window, duration } => Some(duration.unwrap_or(*window)),
            Self::EvenArrival { duration } | Self::Pause { duration } => Some(*duration),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateArrival {
                rate_per_second,
                duration,
                max_arrivals,
            } => {
                match duration {
                    Some(d) => write!(f, "rate({rate_per_second}/sec, {})", DisplayDuration(*d))?,
                    None => write!(f, "rate({rate_per_second}/sec)")?,
                }
                if let Some(n) = max_arrivals {
                    write!(f, " arrivals_count({n})")?;
                }
                Ok(())
            }
            Self::RandomArrival { window, duration } => match duration {
                Some(d) => write!(
                    f,
                    "random_arrivals({}, {})",
                    DisplayDuration(*window),
                    DisplayDuration(*d)
                ),
                None => write!(f, "random_arrivals({})", DisplayDuration(*window)),
            },
            Self::EvenArrival { duration } => {
                write!(f, "even_arrivals({})", DisplayDuration(*duration))
            }
            Self::Pause { duration } => write!(f, "pause({})", DisplayDuration(*duration)),
        }
    }
}

/// Ordered list of phases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleSpec {
    phases: Vec<Phase>,
}

impl ScheduleSpec {
    #[must_use]
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Total schedule length, or `None` when some phase never ends.
    #[must_use]
    pub fn total_duration(&self) -> Option<Duration> {
        let last = self.phases.len().saturating_sub(1);
        let mut total = Duration::ZERO;
        for (idx, phase) in self.phases.iter().enumerate() {
            match phase {
                Phase::RateArrival {
                    rate_per_second,
                    duration: None,
                    max_arrivals,
                } => match max_arrivals {
                    Some(n) if *rate_per_second > 0.0 => {
                        total = total.saturating_add(Duration::from_secs_f64(
                            *n as f64 / rate_per_second,
                        ));
                    }
                    Some(_) => {}
                    // A level-setting rate takes no time; the trailing one never ends.
                    None if idx == last && *rate_per_second > 0.0 => return None,
                    None => {}
                },
                Phase::RandomArrival {
                    duration: None,
                    window,
                } if !self.has_rate_before(idx) => {
                    if window.is_zero() {
                        continue;
                    }
                    return None;
                }
                other => {
                    total = total.saturating_add(other.duration().unwrap_or(Duration::ZERO));
                }
            }
        }
        Some(total)
    }

    fn has_rate_before(&self, idx: usize) -> bool {
        self.phases[..idx]
            .iter()
            .any(|p| matches!(p, Phase::RateArrival { .. }))
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, phase) in self.phases.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{phase}")?;
        }
        Ok(())
    }
}

impl FromStr for ScheduleSpec {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_schedule(s)
    }
}

/// Renders a duration in milliseconds without losing nanosecond precision.
struct DisplayDuration(Duration);

impl fmt::Display for DisplayDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        let ms = nanos / 1_000_000;
        let frac = nanos % 1_000_000;
        if frac == 0 {
            return write!(f, "{ms}ms");
        }
        let digits = format!("{frac:06}");
        write!(f, "{ms}.{}ms", digits.trim_end_matches('0'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(input: &str) -> ScheduleSpec {
        parse_schedule(input).unwrap_or_else(|e| panic!("`{input}` should parse: {e}"))
    }

    #[test]
    fn display_parses_back_to_the_same_phases() {
        for input in [
            "rate(50/sec) random_arrivals(100ms) pause(2s)",
            "rate(10/min) random_arrivals(10min) rate(20/min)",
            "rate(3/sec, 1.5s) arrivals_count(4) even_arrivals(250ms)",
            "rate(7/hour) random_arrivals(1s, 1min) pause(0.0000015s)",
            "pause(0) rate(0/sec)",
        ] {
            let parsed = spec(input);
            let rendered = parsed.to_string();
            assert_eq!(spec(&rendered), parsed, "round trip of `{input}` via `{rendered}`");
        }
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(
            spec("rate( 50/sec ) random_arrivals(0.1) pause(2s)").to_string(),
            "rate(50/sec) random_arrivals(100ms) pause(2000ms)"
        );
        assert_eq!(
            spec("rate(6/min, 1min) arrivals_count(3)").to_string(),
            "rate(0.1/sec, 60000ms) arrivals_count(3)"
        );
    }

    #[test]
    fn total_duration_of_bounded_schedule() {
        assert_eq!(
            spec("rate(50/sec) random_arrivals(100ms) pause(2s)").total_duration(),
            Some(Duration::from_millis(2100))
        );
        assert_eq!(
            spec("rate(10/sec) arrivals_count(5) pause(1s)").total_duration(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn total_duration_of_unbounded_schedule() {
        assert_eq!(spec("rate(50/sec)").total_duration(), None);
        assert_eq!(spec("random_arrivals(100ms)").total_duration(), None);
        assert_eq!(
            spec("rate(5/sec) pause(1s)").total_duration(),
            Some(Duration::from_secs(1))
        );
    }
}
