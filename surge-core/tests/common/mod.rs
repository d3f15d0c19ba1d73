#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use surge_core::{Outcome, PlanFactory, UnitError, UnitKind, UnitOfWork, VuContext, plan_fn};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Sampler that records which user ran it and when, relative to `t0`.
#[derive(Clone)]
pub struct Recorder {
    pub t0: Instant,
    pub latency: Duration,
    pub seen: Arc<Mutex<Vec<(u64, Duration)>>>,
}

impl Recorder {
    pub fn new(latency: Duration) -> Self {
        Self {
            t0: Instant::now(),
            latency,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn plan(&self) -> Arc<dyn PlanFactory> {
        let recorder = self.clone();
        plan_fn(move || Ok(Arc::new(recorder.clone()) as Arc<dyn UnitOfWork>))
    }

    pub fn seen(&self) -> Vec<(u64, Duration)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl UnitOfWork for Recorder {
    fn label(&self) -> &str {
        "record"
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Sampler
    }

    async fn execute(&self, ctx: &mut VuContext) -> Result<Outcome, UnitError> {
        self.seen.lock().push((ctx.user(), self.t0.elapsed()));
        ctx.sleep(self.latency).await?;
        Ok(Outcome::success())
    }
}

/// Blocks like an outstanding socket read that only `interrupt` can wake.
#[derive(Default)]
pub struct BlockingRead {
    wake: Notify,
}

#[async_trait]
impl UnitOfWork for BlockingRead {
    fn label(&self) -> &str {
        "read"
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Sampler
    }

    async fn execute(&self, _ctx: &mut VuContext) -> Result<Outcome, UnitError> {
        self.wake.notified().await;
        Err(UnitError::Interrupted)
    }

    fn interrupt(&self) -> bool {
        self.wake.notify_one();
        true
    }
}

/// Ignores every stop signal.
pub struct Deaf;

#[async_trait]
impl UnitOfWork for Deaf {
    fn label(&self) -> &str {
        "deaf"
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Sampler
    }

    async fn execute(&self, _ctx: &mut VuContext) -> Result<Outcome, UnitError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Outcome::success())
    }
}
