use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strum::{Display, EnumString};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::schedule::parse_duration;

/// Whose iterations a throughput target applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ThroughputMode {
    /// Each user keeps its own schedule at the target rate.
    #[default]
    ThisUser,
    /// Target is split across the users currently active in the group.
    GroupActive,
    /// Target is split across the users currently active in the engine.
    AllActive,
    /// One schedule shared by every user of the group.
    GroupShared,
    /// One schedule shared by every user of the engine.
    AllShared,
}

/// Delay applied between two iterations of the same user.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Pacing {
    #[default]
    None,
    Fixed(Duration),
    /// Uniform in `[base, base + range]`; a negative range means `[base - |range|, base]`.
    Uniform { base: Duration, range_ms: i64 },
    Throughput { per_minute: f64, mode: ThroughputMode },
}

impl fmt::Display for Pacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Fixed(d) => write!(f, "fixed({}ms)", d.as_millis()),
            Self::Uniform { base, range_ms } => {
                write!(f, "uniform({}ms, {range_ms}ms)", base.as_millis())
            }
            Self::Throughput { per_minute, mode } => {
                write!(f, "throughput({per_minute}/min, {mode})")
            }
        }
    }
}

impl FromStr for Pacing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let input = s.trim();
        let invalid = |reason: &str| Error::InvalidPacing {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() || input == "none" {
            return Ok(Self::None);
        }

        let Some((name, rest)) = input.split_once('(') else {
            return Err(invalid("expected `none`, `fixed(..)`, `uniform(..)` or `throughput(..)`"));
        };
        let Some(args) = rest.strip_suffix(')') else {
            return Err(invalid("missing `)`"));
        };
        let args: Vec<&str> = args.split(',').map(str::trim).collect();
        let duration = |arg: &str| parse_duration(arg).map_err(|e| invalid(&e.to_string()));

        match (name.trim(), args.as_slice()) {
            ("fixed", [delay]) => Ok(Self::Fixed(duration(delay)?)),
            ("uniform", [base, range]) => {
                let (negative, magnitude) = match range.strip_prefix('-') {
                    Some(m) => (true, m),
                    None => (false, *range),
                };
                let range_ms = i64::try_from(duration(magnitude)?.as_millis())
                    .map_err(|_| invalid("range is too large"))?;
                Ok(Self::Uniform {
                    base: duration(base)?,
                    range_ms: if negative { -range_ms } else { range_ms },
                })
            }
            ("throughput", [target, mode @ ..]) if mode.len() <= 1 => {
                let per_minute = parse_per_minute(target).ok_or_else(|| {
                    invalid("throughput must look like `600/min`, `10/sec` or `36000/hour`")
                })?;
                let mode = match mode.first() {
                    Some(m) => m
                        .parse::<ThroughputMode>()
                        .map_err(|_| invalid("unknown throughput mode"))?,
                    None => ThroughputMode::default(),
                };
                Ok(Self::Throughput { per_minute, mode })
            }
            _ => Err(invalid("unknown pacing or wrong number of arguments")),
        }
    }
}

fn parse_per_minute(input: &str) -> Option<f64> {
    let (number, unit) = input.split_once('/').unwrap_or((input, "min"));
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let per_minute = match unit.trim() {
        "min" | "m" | "minute" => value,
        "sec" | "s" | "second" => value * 60.0,
        "hour" | "h" => value / 60.0,
        _ => return None,
    };
    if per_minute > 0.0 && throughput_interval(per_minute).is_none() {
        return None;
    }
    Some(per_minute)
}

/// Interval between iterations for a positive throughput, if it fits in a `Duration`.
pub(crate) fn throughput_interval(per_minute: f64) -> Option<Duration> {
    if !(per_minute.is_finite() && per_minute > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(60.0 / per_minute).ok()
}

/// Last start time handed out by a shared throughput schedule.
#[derive(Debug, Default)]
pub struct ThroughputSlot {
    last: Mutex<Option<Instant>>,
}

impl ThroughputSlot {
    fn claim(&self, interval: Duration, now: Instant) -> Duration {
        let mut last = self.last.lock();
        let target = match *last {
            None => now,
            Some(l) => match l.checked_add(interval) {
                Some(t) => t.max(now),
                None => return interval,
            },
        };
        *last = Some(target);
        target - now
    }
}

/// Counters and shared schedules a pacing timer may consult.
#[derive(Debug, Clone, Default)]
pub struct PacingEnv {
    pub group_active: Arc<AtomicU64>,
    pub engine_active: Arc<AtomicU64>,
    pub group_slot: Arc<ThroughputSlot>,
    pub engine_slot: Arc<ThroughputSlot>,
}

/// The iteration that just finished.
#[derive(Debug, Clone, Copy)]
pub struct PreviousIteration {
    pub started: Instant,
}

/// Per-user pacing state.
#[derive(Debug)]
pub struct PacingTimer {
    pacing: Pacing,
    env: PacingEnv,
    rng: StdRng,
    last_target: Option<Instant>,
}

impl PacingTimer {
    pub fn new(pacing: Pacing, env: PacingEnv, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            pacing,
            env,
            rng,
            last_target: None,
        }
    }

    /// Delay before the next iteration. Never negative; zero when behind schedule.
    pub fn delay(&mut self, previous: &PreviousIteration, now: Instant) -> Duration {
        match &self.pacing {
            Pacing::None => Duration::ZERO,
            Pacing::Fixed(d) => *d,
            Pacing::Uniform { base, range_ms } => {
                let base = base.as_millis() as i128;
                let other = base + *range_ms as i128;
                let lo = base.min(other).max(0);
                let hi = base.max(other).max(0);
                let ms = self.rng.random_range(lo..=hi);
                Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
            }
            Pacing::Throughput { per_minute, mode } => {
                let Some(interval) = throughput_interval(*per_minute) else {
                    return Duration::ZERO;
                };
                match mode {
                    ThroughputMode::ThisUser => self.own_schedule(interval, previous, now),
                    ThroughputMode::GroupActive => {
                        let active = self.env.group_active.load(Ordering::Relaxed).max(1);
                        self.own_schedule(interval.saturating_mul(clamp_u32(active)), previous, now)
                    }
                    ThroughputMode::AllActive => {
                        let active = self.env.engine_active.load(Ordering::Relaxed).max(1);
                        self.own_schedule(interval.saturating_mul(clamp_u32(active)), previous, now)
                    }
                    ThroughputMode::GroupShared => self.env.group_slot.claim(interval, now),
                    ThroughputMode::AllShared => self.env.engine_slot.claim(interval, now),
                }
            }
        }
    }

    fn own_schedule(
        &mut self,
        interval: Duration,
        previous: &PreviousIteration,
        now: Instant,
    ) -> Duration {
        let anchor = self.last_target.unwrap_or(previous.started);
        let Some(target) = anchor.checked_add(interval) else {
            return interval;
        };
        if target <= now {
            // Behind schedule: start right away and rebase.
            self.last_target = Some(now);
            return Duration::ZERO;
        }
        self.last_target = Some(target);
        target - now
    }
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}
