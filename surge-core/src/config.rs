use std::time::Duration;

use crate::arrival::ArrivalDistribution;
use crate::error::{Error, Result};
use crate::pacing::{Pacing, throughput_interval};
use crate::schedule::ScheduleSpec;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_millis(250);

/// What a virtual user does after a sampler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum OnSampleError {
    #[default]
    Continue,
    /// Abandon the rest of the iteration and start the next one.
    StartNextLoop,
    StopUser,
    /// Stop the whole group gracefully.
    StopGroup,
    /// Stop the whole group, interrupting in-flight work.
    StopGroupNow,
}

/// Concurrency model kind (the string form used by the CLI).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::EnumString, strum::Display)]
pub enum ModelKind {
    #[default]
    #[strum(to_string = "closed", serialize = "threads")]
    Closed,
    #[strum(to_string = "open", serialize = "arrivals")]
    Open,
}

/// Fixed pool of users that loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedModel {
    pub users: u64,
    pub ramp_up: Duration,
    /// Iterations per user.
    pub loops: Option<u64>,
    /// Group duration, measured from the end of `delay_before_start`.
    pub duration: Option<Duration>,
    pub delay_before_start: Duration,
}

impl ClosedModel {
    pub fn new(users: u64) -> Self {
        Self {
            users,
            ramp_up: Duration::ZERO,
            loops: None,
            duration: None,
            delay_before_start: Duration::ZERO,
        }
    }
}

/// Users arrive according to a schedule; each arrival runs a single iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenModel {
    pub schedule: ScheduleSpec,
    pub distribution: ArrivalDistribution,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConcurrencyModel {
    Closed(ClosedModel),
    Open(OpenModel),
}

impl ConcurrencyModel {
    #[must_use]
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Closed(_) => ModelKind::Closed,
            Self::Open(_) => ModelKind::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadGroupConfig {
    pub name: String,
    pub model: ConcurrencyModel,
    pub pacing: Pacing,
    pub on_sample_error: OnSampleError,
    /// Seeds arrival schedules, pacing and per-user randomness.
    pub seed: Option<u64>,
}

impl ThreadGroupConfig {
    pub fn closed(name: impl Into<String>, model: ClosedModel) -> Self {
        Self::new(name, ConcurrencyModel::Closed(model))
    }

    pub fn open(name: impl Into<String>, schedule: ScheduleSpec) -> Self {
        Self::new(
            name,
            ConcurrencyModel::Open(OpenModel {
                schedule,
                distribution: ArrivalDistribution::default(),
            }),
        )
    }

    fn new(name: impl Into<String>, model: ConcurrencyModel) -> Self {
        Self {
            name: name.into(),
            model,
            pacing: Pacing::None,
            on_sample_error: OnSampleError::Continue,
            seed: None,
        }
    }

    #[must_use]
    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    #[must_use]
    pub fn with_on_sample_error(mut self, action: OnSampleError) -> Self {
        self.on_sample_error = action;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidName {
                kind: "thread group name",
                input: self.name.clone(),
            });
        }
        let group = || self.name.clone();

        match &self.model {
            ConcurrencyModel::Closed(m) => {
                if m.users == 0 {
                    return Err(Error::InvalidUsers { group: group() });
                }
                if m.loops == Some(0) {
                    return Err(Error::InvalidLoops { group: group() });
                }
                if m.duration.is_some_and(|d| d.is_zero()) {
                    return Err(Error::InvalidDuration { group: group() });
                }
            }
            ConcurrencyModel::Open(m) => {
                if m.schedule.is_empty() {
                    return Err(Error::EmptySchedule { group: group() });
                }
            }
        }

        if let Pacing::Throughput { per_minute, .. } = &self.pacing
            && throughput_interval(*per_minute).is_none()
        {
            return Err(Error::InvalidPacing {
                input: self.pacing.to_string(),
                reason: "throughput must be positive with an interval that fits a duration"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Loosely typed thread group settings, as collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct ThreadGroupOptions {
    pub name: Option<String>,
    pub model: Option<String>,

    // Closed model
    pub users: Option<u64>,
    pub ramp_up: Option<Duration>,
    pub loops: Option<u64>,
    pub duration: Option<Duration>,
    pub delay: Option<Duration>,

    // Open model
    pub schedule: Option<String>,
    pub distribution: Option<String>,

    pub pacing: Option<String>,
    pub on_error: Option<String>,
    pub seed: Option<u64>,
}

impl ThreadGroupOptions {
    pub fn into_config(self) -> Result<ThreadGroupConfig> {
        let name = self.name.unwrap_or_else(|| "default".to_string());
        let kind: ModelKind = match self.model.as_deref() {
            Some(m) => m.parse().map_err(|_| Error::InvalidName {
                kind: "concurrency model",
                input: m.to_string(),
            })?,
            None => ModelKind::default(),
        };

        let model = match kind {
            ModelKind::Closed => ConcurrencyModel::Closed(ClosedModel {
                users: self.users.unwrap_or(1),
                ramp_up: self.ramp_up.unwrap_or_default(),
                loops: self.loops,
                duration: self.duration,
                delay_before_start: self.delay.unwrap_or_default(),
            }),
            ModelKind::Open => {
                let Some(schedule) = self.schedule else {
                    return Err(Error::MissingSchedule { group: name });
                };
                if self.users.is_some() || self.loops.is_some() {
                    log::warn!(
                        "thread group `{name}`: `users` and `loops` are ignored by the open model"
                    );
                }
                let distribution = match self.distribution.as_deref() {
                    Some(d) => d.parse().map_err(|_| Error::InvalidName {
                        kind: "arrival distribution",
                        input: d.to_string(),
                    })?,
                    None => ArrivalDistribution::default(),
                };
                ConcurrencyModel::Open(OpenModel {
                    schedule: schedule.parse()?,
                    distribution,
                })
            }
        };

        let pacing = match self.pacing.as_deref() {
            Some(p) => p.parse()?,
            None => Pacing::None,
        };
        let on_sample_error = match self.on_error.as_deref() {
            Some(a) => a.parse().map_err(|_| Error::InvalidName {
                kind: "on-error action",
                input: a.to_string(),
            })?,
            None => OnSampleError::default(),
        };

        let config = ThreadGroupConfig {
            name,
            model,
            pacing,
            on_sample_error,
            seed: self.seed,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Engine-wide stop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a graceful stop waits for users before interrupting them.
    pub stop_timeout: Duration,
    /// How long interrupted users get before they are abandoned.
    pub interrupt_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
        }
    }
}
