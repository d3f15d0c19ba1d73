//! The unit-of-work contract shared by samplers, controllers and timers.

mod controllers;
mod samplers;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use strum::{Display, EnumString};
use surge_value::Value;

use crate::context::VuContext;

pub use controllers::{If, Loop, Sequence};
pub use samplers::{Dummy, Think};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum UnitKind {
    /// Leaf that produces a sample event for every execution.
    Sampler,
    /// Composite that delegates to its children.
    Controller,
    /// Leaf that only spends time.
    Timer,
}

/// Why an execution did not produce an outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    /// Recoverable failure of this execution; the user carries on.
    #[error("{0}")]
    Failed(String),

    #[error("interrupted")]
    Interrupted,

    /// Unrecoverable for this virtual user; it stops after the current iteration.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result of one execution.
///
/// Units fill in `success`, `payload` and `message`; the context stamps the label and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub label: Arc<str>,
    pub success: bool,
    pub started_at: SystemTime,
    pub elapsed: Duration,
    pub payload: Value,
    pub message: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            label: Arc::from(""),
            success: true,
            started_at: SystemTime::UNIX_EPOCH,
            elapsed: Duration::ZERO,
            payload: Value::Null,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::success()
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// One executable step of a test plan.
///
/// Instances are created per virtual user, so `&self` methods never race with another user.
/// `interrupt` may be called from another task while `execute` is in flight.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    fn label(&self) -> &str;

    fn kind(&self) -> UnitKind;

    async fn execute(&self, ctx: &mut VuContext) -> Result<Outcome, UnitError>;

    /// Aborts in-flight work that does not observe the context's interrupt token.
    ///
    /// Returns `true` when something was interrupted.
    fn interrupt(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("label", &self.label())
            .field("kind", &self.kind())
            .finish()
    }
}
