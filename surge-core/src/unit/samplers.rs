use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use surge_value::Value;

use super::{Outcome, UnitError, UnitKind, UnitOfWork};
use crate::context::VuContext;

/// Synthetic sampler: waits `latency` and then succeeds or fails.
///
/// Stands in for a protocol sampler when exercising schedules and pacing.
#[derive(Debug, Clone)]
pub struct Dummy {
    label: String,
    latency: Duration,
    success: bool,
    error_rate: f64,
    payload: Value,
    store_as: Option<String>,
}

impl Dummy {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            latency: Duration::ZERO,
            success: true,
            error_rate: 0.0,
            payload: Value::Null,
            store_as: None,
        }
    }

    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Probability in `[0, 1]` that an otherwise successful sample fails.
    #[must_use]
    pub fn error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Stores the payload in the named user variable after each execution.
    #[must_use]
    pub fn store_as(mut self, var: impl Into<String>) -> Self {
        self.store_as = Some(var.into());
        self
    }
}

#[async_trait]
impl UnitOfWork for Dummy {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Sampler
    }

    async fn execute(&self, ctx: &mut VuContext) -> Result<Outcome, UnitError> {
        ctx.sleep(self.latency).await?;

        if let Some(var) = &self.store_as {
            ctx.set_var(var.clone(), self.payload.clone());
        }

        let failed =
            !self.success || (self.error_rate > 0.0 && ctx.rng().random_bool(self.error_rate));
        if failed {
            return Err(UnitError::Failed("simulated error".to_string()));
        }
        Ok(Outcome::success().with_payload(self.payload.clone()))
    }
}

/// Think time: waits `delay` plus a uniform extra in `[0, range]`.
#[derive(Debug, Clone)]
pub struct Think {
    label: String,
    delay: Duration,
    range: Duration,
}

impl Think {
    pub fn new(label: impl Into<String>, delay: Duration, range: Duration) -> Self {
        Self {
            label: label.into(),
            delay,
            range,
        }
    }
}

#[async_trait]
impl UnitOfWork for Think {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Timer
    }

    async fn execute(&self, ctx: &mut VuContext) -> Result<Outcome, UnitError> {
        let extra = if self.range.is_zero() {
            Duration::ZERO
        } else {
            let nanos = u64::try_from(self.range.as_nanos()).unwrap_or(u64::MAX);
            Duration::from_nanos(ctx.rng().random_range(0..=nanos))
        };
        ctx.sleep(self.delay.saturating_add(extra)).await?;
        Ok(Outcome::success())
    }
}
