use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ahash::AHashMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use surge_value::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::OnSampleError;
use crate::sink::{ResultSink, SampleEvent};
use crate::unit::{Outcome, UnitError, UnitKind, UnitOfWork};

/// Per-user execution context, passed explicitly into every `execute` call.
///
/// Owned by exactly one virtual user; the variable namespace survives across iterations.
pub struct VuContext {
    group: Arc<str>,
    user: u64,
    iteration: u64,
    vars: AHashMap<String, Value>,
    interrupt: CancellationToken,
    sink: Arc<dyn ResultSink>,
    on_error: OnSampleError,
    rng: StdRng,

    sample_failed: bool,
    fatal: Option<String>,
}

impl VuContext {
    pub(crate) fn new(
        group: Arc<str>,
        user: u64,
        interrupt: CancellationToken,
        sink: Arc<dyn ResultSink>,
        on_error: OnSampleError,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ user.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_os_rng(),
        };
        Self {
            group,
            user,
            iteration: 0,
            vars: AHashMap::new(),
            interrupt,
            sink,
            on_error,
            rng,
            sample_failed: false,
            fatal: None,
        }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn user(&self) -> u64 {
        self.user
    }

    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    #[must_use]
    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn remove_var(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Cancelled when the user is hard-interrupted.
    #[must_use]
    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Runs `fut` unless the user is interrupted first.
    ///
    /// Blocking I/O inside a unit should be wrapped in this so it aborts on interrupt.
    pub async fn cancellable<F>(&self, fut: F) -> Result<F::Output, UnitError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => Err(UnitError::Interrupted),
            out = fut => Ok(out),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), UnitError> {
        if duration.is_zero() {
            return if self.is_interrupted() {
                Err(UnitError::Interrupted)
            } else {
                Ok(())
            };
        }
        self.cancellable(tokio::time::sleep(duration)).await
    }

    /// Whether composites should skip the rest of the current iteration.
    #[must_use]
    pub fn should_stop_iteration(&self) -> bool {
        self.is_interrupted()
            || self.fatal.is_some()
            || (self.sample_failed && self.on_error != OnSampleError::Continue)
    }

    /// Executes `unit`, converting errors into failure outcomes.
    ///
    /// Sampler outcomes are delivered to the result sink. Anything finishing after an
    /// interrupt is reported as a failure.
    pub async fn execute(&mut self, unit: &dyn UnitOfWork) -> Outcome {
        let label: Arc<str> = Arc::from(unit.label());
        if self.is_interrupted() {
            let mut outcome = Outcome::failure("interrupted");
            outcome.label = label;
            outcome.started_at = SystemTime::now();
            return outcome;
        }

        let started_at = SystemTime::now();
        let t0 = Instant::now();
        let result = unit.execute(self).await;
        let elapsed = t0.elapsed();

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(UnitError::Failed(message)) => Outcome::failure(message),
            Err(UnitError::Interrupted) => Outcome::failure("interrupted"),
            Err(UnitError::Fatal(message)) => {
                log::error!(
                    "group `{}` user {}: fatal error in `{}`: {message}",
                    self.group,
                    self.user,
                    unit.label()
                );
                self.fatal.get_or_insert_with(|| message.clone());
                Outcome::failure(message)
            }
        };
        if outcome.success && self.is_interrupted() {
            outcome.success = false;
            outcome.message = Some("interrupted".to_string());
        }
        outcome.label = label;
        outcome.started_at = started_at;
        outcome.elapsed = elapsed;

        if unit.kind() == UnitKind::Sampler {
            if !outcome.success {
                self.sample_failed = true;
            }
            self.emit(&outcome);
        }
        outcome
    }

    fn emit(&self, outcome: &Outcome) {
        self.sink.deliver(SampleEvent {
            group: self.group.clone(),
            user: self.user,
            iteration: self.iteration,
            label: outcome.label.clone(),
            success: outcome.success,
            started_at: outcome.started_at,
            elapsed: outcome.elapsed,
            payload: outcome.payload.clone(),
            message: outcome.message.clone(),
        });
    }

    pub(crate) fn begin_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
        self.sample_failed = false;
    }

    /// Whether a sampler failed during the current iteration.
    pub(crate) fn sample_failed(&self) -> bool {
        self.sample_failed
    }

    pub(crate) fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// Reports an iteration that was dropped because it ignored the interrupt.
    pub(crate) fn abandon(&mut self, label: &str, started_at: SystemTime, elapsed: Duration) {
        let mut outcome = Outcome::failure("interrupt timeout");
        outcome.label = Arc::from(label);
        outcome.started_at = started_at;
        outcome.elapsed = elapsed;
        self.emit(&outcome);
    }
}

impl std::fmt::Debug for VuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VuContext")
            .field("group", &self.group)
            .field("user", &self.user)
            .field("iteration", &self.iteration)
            .field("vars", &self.vars.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::sink::MemorySink;

    struct Fixed {
        result: Result<(), UnitError>,
    }

    #[async_trait]
    impl UnitOfWork for Fixed {
        fn label(&self) -> &str {
            "fixed"
        }

        fn kind(&self) -> UnitKind {
            UnitKind::Sampler
        }

        async fn execute(&self, _ctx: &mut VuContext) -> Result<Outcome, UnitError> {
            self.result.clone().map(|()| Outcome::success())
        }
    }

    fn ctx(sink: Arc<MemorySink>, token: CancellationToken) -> VuContext {
        VuContext::new(Arc::from("g"), 3, token, sink, OnSampleError::Continue, Some(1))
    }

    #[tokio::test]
    async fn errors_become_failed_samples() {
        let sink = MemorySink::new();
        let mut ctx = ctx(sink.clone(), CancellationToken::new());

        let ok = ctx.execute(&Fixed { result: Ok(()) }).await;
        assert!(ok.success);
        assert!(!ctx.sample_failed());

        let failed = ctx
            .execute(&Fixed {
                result: Err(UnitError::Failed("boom".to_string())),
            })
            .await;
        assert!(!failed.success);
        assert_eq!(failed.message.as_deref(), Some("boom"));
        assert!(ctx.sample_failed());
        assert!(ctx.fatal().is_none());

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(&*events[0].label, "fixed");
        assert_eq!(events[1].user, 3);
    }

    #[tokio::test]
    async fn fatal_error_is_recorded() {
        let sink = MemorySink::new();
        let mut ctx = ctx(sink, CancellationToken::new());
        ctx.execute(&Fixed {
            result: Err(UnitError::Fatal("out of sockets".to_string())),
        })
        .await;
        assert_eq!(ctx.fatal(), Some("out of sockets"));
        assert!(ctx.should_stop_iteration());
    }

    #[tokio::test]
    async fn interrupted_context_skips_execution() {
        let sink = MemorySink::new();
        let token = CancellationToken::new();
        let mut ctx = ctx(sink.clone(), token.clone());
        token.cancel();

        let outcome = ctx.execute(&Fixed { result: Ok(()) }).await;
        assert!(!outcome.success);
        assert!(sink.is_empty());
        assert_eq!(ctx.sleep(Duration::from_secs(60)).await, Err(UnitError::Interrupted));
    }

    #[tokio::test]
    async fn variables_persist() {
        let mut ctx = ctx(MemorySink::new(), CancellationToken::new());
        ctx.set_var("token", "abc");
        ctx.begin_iteration(1);
        assert_eq!(ctx.var("token"), Some(&Value::from("abc")));
        assert_eq!(ctx.remove_var("token"), Some(Value::from("abc")));
        assert!(ctx.var("token").is_none());
    }
}
