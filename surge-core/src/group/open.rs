use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{GroupRun, GroupShared, RunState};
use crate::arrival::ArrivalProcess;
use crate::config::OpenModel;
use crate::error::Result;
use crate::gate::IterationGate;

impl GroupShared {
    /// One single-iteration user per arrival, regardless of how many are still running.
    pub(super) async fn run_open(
        self: &Arc<Self>,
        model: &OpenModel,
        run: &mut GroupRun,
    ) -> Result<()> {
        let mut arrivals =
            ArrivalProcess::new(model.schedule.clone(), self.config.seed, model.distribution);
        self.advance(RunState::Running);

        // Arrivals are scheduled against absolute offsets so waits do not drift.
        let start = Instant::now();
        let mut offset = Duration::ZERO;
        for delay in arrivals.by_ref() {
            offset = offset.saturating_add(delay);
            if !self.wait_until(run, start + offset).await {
                return Ok(());
            }
            if !self.spawn_user(run, IterationGate::once())? {
                return Ok(());
            }
        }

        let idle = arrivals.pending_idle();
        if !idle.is_zero() && !self.wait_until(run, start + offset + idle).await {
            return Ok(());
        }
        log::info!(
            "group `{}`: schedule finished after {} arrival(s)",
            self.name,
            run.report.spawned
        );
        Ok(())
    }
}
