use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strum::{Display, EnumString};

use crate::schedule::{Phase, ScheduleSpec};

const NANOS_PER_SEC: f64 = 1e9;
// Absorbs float noise such as `0.3 * 10.0 == 2.9999999999999996`.
const COUNT_EPSILON: f64 = 1e-9;

/// How random phases place their arrivals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ArrivalDistribution {
    /// Uniform placement inside each window (or uniform delays in `[0, window]`).
    #[default]
    Uniform,
    /// Poisson process: exponentially distributed inter-arrival delays.
    Exponential,
}

/// Lazy, restartable sequence of inter-arrival delays for one schedule.
///
/// Idle time (pauses, unused parts of bounded phases) is folded into the delay of the
/// next arrival. Once the sequence is exhausted, [`ArrivalProcess::pending_idle`] reports
/// the idle time left at the end of the schedule.
#[derive(Debug)]
pub struct ArrivalProcess {
    spec: ScheduleSpec,
    seed: Option<u64>,
    distribution: ArrivalDistribution,
    rng: StdRng,

    cursor: usize,
    rate: Option<f64>,
    idle_ns: u64,
    state: Option<PhaseState>,
}

#[derive(Debug)]
enum PhaseState {
    /// Arrivals at `k * interval` for `k = 1..`, bounded by `limit` and `span`.
    Even {
        interval: f64,
        emitted: u64,
        limit: Option<u64>,
        span: Option<u64>,
        last: u64,
    },
    /// Consecutive windows, each holding `rate * window` arrivals placed uniformly.
    Windowed {
        rate: f64,
        window: u64,
        span: u64,
        window_end: u64,
        remaining: u64,
        carry: f64,
        at: f64,
        last: u64,
    },
    /// Poisson arrivals at `rate` until `span` is consumed.
    Poisson {
        rate: f64,
        span: u64,
        at: f64,
        last: u64,
    },
    /// Independent draws spaced by at most `window`, with no rate to honour.
    Free { window: u64, remaining: Option<u64> },
}

enum Step {
    Arrival(u64),
    Done(u64),
}

impl ArrivalProcess {
    pub fn new(spec: ScheduleSpec, seed: Option<u64>, distribution: ArrivalDistribution) -> Self {
        Self {
            spec,
            seed,
            distribution,
            rng: make_rng(seed),
            cursor: 0,
            rate: None,
            idle_ns: 0,
            state: None,
        }
    }

    /// Rewinds to the first phase. A seeded process replays the same sequence.
    pub fn reset(&mut self) {
        self.rng = make_rng(self.seed);
        self.cursor = 0;
        self.rate = None;
        self.idle_ns = 0;
        self.state = None;
    }

    #[must_use]
    pub fn spec(&self) -> &ScheduleSpec {
        &self.spec
    }

    /// Idle time accumulated since the last produced arrival.
    #[must_use]
    pub fn pending_idle(&self) -> Duration {
        Duration::from_nanos(self.idle_ns)
    }

    #[must_use]
    pub fn total_duration(&self) -> Option<Duration> {
        self.spec.total_duration()
    }

    fn start_phase(&mut self, idx: usize) {
        let is_last = idx + 1 == self.spec.phases().len();
        let Some(phase) = self.spec.phases().get(idx).cloned() else {
            return;
        };

        match phase {
            Phase::RateArrival {
                rate_per_second,
                duration,
                max_arrivals,
            } => {
                self.rate = Some(rate_per_second);
                if duration.is_none() && max_arrivals.is_none() && !is_last {
                    return;
                }
                if rate_per_second <= 0.0 {
                    self.add_idle(duration.map(nanos).unwrap_or(0));
                    return;
                }
                let span = duration.map(nanos);
                let by_time = duration.map(|d| whole(rate_per_second * d.as_secs_f64()));
                let limit = match (by_time, max_arrivals) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                self.state = Some(PhaseState::Even {
                    interval: NANOS_PER_SEC / rate_per_second,
                    emitted: 0,
                    limit,
                    span,
                    last: 0,
                });
            }
            Phase::EvenArrival { duration } => match self.rate {
                Some(rate) if rate > 0.0 => {
                    self.state = Some(PhaseState::Even {
                        interval: NANOS_PER_SEC / rate,
                        emitted: 0,
                        limit: Some(whole(rate * duration.as_secs_f64())),
                        span: Some(nanos(duration)),
                        last: 0,
                    });
                }
                _ => self.add_idle(nanos(duration)),
            },
            Phase::RandomArrival { window, duration } => {
                let window = nanos(window);
                let span = duration.map(nanos);
                if window == 0 {
                    self.add_idle(span.unwrap_or(0));
                    return;
                }
                if self.rate.is_some_and(|rate| rate <= 0.0) {
                    self.add_idle(span.unwrap_or(window));
                    return;
                }
                self.state = Some(match (self.rate, self.distribution) {
                    (Some(rate), ArrivalDistribution::Uniform) => PhaseState::Windowed {
                        rate,
                        window,
                        span: span.unwrap_or(window),
                        window_end: 0,
                        remaining: 0,
                        carry: 0.0,
                        at: 0.0,
                        last: 0,
                    },
                    (Some(rate), ArrivalDistribution::Exponential) => PhaseState::Poisson {
                        rate,
                        span: span.unwrap_or(window),
                        at: 0.0,
                        last: 0,
                    },
                    (None, _) => PhaseState::Free {
                        window,
                        remaining: span,
                    },
                });
            }
            Phase::Pause { duration } => self.add_idle(nanos(duration)),
        }
    }

    fn add_idle(&mut self, ns: u64) {
        self.idle_ns = self.idle_ns.saturating_add(ns);
    }
}

impl Iterator for ArrivalProcess {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        loop {
            let Some(state) = self.state.as_mut() else {
                if self.cursor >= self.spec.phases().len() {
                    return None;
                }
                let idx = self.cursor;
                self.cursor += 1;
                self.start_phase(idx);
                continue;
            };

            match state.step(&mut self.rng, self.distribution) {
                Step::Arrival(delta) => {
                    let delay = self.idle_ns.saturating_add(delta);
                    self.idle_ns = 0;
                    return Some(Duration::from_nanos(delay));
                }
                Step::Done(rest) => {
                    self.state = None;
                    self.add_idle(rest);
                }
            }
        }
    }
}

impl PhaseState {
    fn step(&mut self, rng: &mut StdRng, distribution: ArrivalDistribution) -> Step {
        match self {
            Self::Even {
                interval,
                emitted,
                limit,
                span,
                last,
            } => {
                if limit.is_some_and(|l| *emitted >= l) {
                    return Step::Done(span.map_or(0, |s| s.saturating_sub(*last)));
                }
                // Absolute positions keep rounding error from accumulating.
                let pos = ((*emitted + 1) as f64 * *interval).round() as u64;
                if let Some(s) = *span
                    && pos > s
                {
                    return Step::Done(s.saturating_sub(*last));
                }
                *emitted += 1;
                let delta = pos.saturating_sub(*last);
                *last = pos.max(*last);
                Step::Arrival(delta)
            }
            Self::Windowed {
                rate,
                window,
                span,
                window_end,
                remaining,
                carry,
                at,
                last,
            } => loop {
                if *remaining > 0 {
                    // Sequential order statistics: the smallest of `remaining` uniforms.
                    let u: f64 = rng.random();
                    let k = *remaining as f64;
                    *at += (*window_end as f64 - *at) * (1.0 - u.powf(1.0 / k));
                    *remaining -= 1;
                    let pos = (at.round() as u64).clamp(*last, *window_end);
                    let delta = pos - *last;
                    *last = pos;
                    return Step::Arrival(delta);
                }
                if *window_end >= *span {
                    return Step::Done(span.saturating_sub(*last));
                }
                let start = *window_end;
                *window_end = start.saturating_add(*window).min(*span);
                let expected = *rate * (*window_end - start) as f64 / NANOS_PER_SEC + *carry;
                *remaining = whole(expected);
                *carry = (expected - *remaining as f64).max(0.0);
                *at = start as f64;
            },
            Self::Poisson {
                rate,
                span,
                at,
                last,
            } => {
                *at += exponential(rng, NANOS_PER_SEC / *rate);
                if *at > *span as f64 {
                    return Step::Done(span.saturating_sub(*last));
                }
                let pos = (at.round() as u64).max(*last);
                let delta = pos - *last;
                *last = pos;
                Step::Arrival(delta)
            }
            Self::Free { window, remaining } => {
                let draw = match distribution {
                    ArrivalDistribution::Uniform => rng.random_range(0..=*window),
                    ArrivalDistribution::Exponential => {
                        exponential(rng, *window as f64 / 2.0).round() as u64
                    }
                };
                match remaining {
                    Some(rest) if draw > *rest => Step::Done(*rest),
                    Some(rest) => {
                        *rest -= draw;
                        Step::Arrival(draw)
                    }
                    None => Step::Arrival(draw),
                }
            }
        }
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

fn exponential(rng: &mut StdRng, mean: f64) -> f64 {
    let u: f64 = rng.random();
    -(1.0 - u).ln() * mean
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn whole(x: f64) -> u64 {
    (x + COUNT_EPSILON).floor().max(0.0) as u64
}
