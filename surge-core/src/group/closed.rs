use std::sync::Arc;

use tokio::time::Instant;

use super::{GroupRun, GroupShared, RunState};
use crate::config::ClosedModel;
use crate::error::Result;
use crate::gate::IterationGate;
use crate::ramp::RampUp;

impl GroupShared {
    /// Fixed pool: optional start delay, linear ramp-up, then wait for the users or the deadline.
    pub(super) async fn run_closed(
        self: &Arc<Self>,
        model: &ClosedModel,
        run: &mut GroupRun,
    ) -> Result<()> {
        if !model.delay_before_start.is_zero() {
            let at = Instant::now() + model.delay_before_start;
            if !self.wait_until(run, at).await {
                return Ok(());
            }
        }

        self.advance(RunState::Running);
        let start = Instant::now();
        let deadline = model.duration.map(|d| start + d);
        let ramp = RampUp::new(model.users, model.ramp_up);

        for index in 0..model.users {
            let at = start + ramp.start_offset(index);
            if deadline.is_some_and(|d| at >= d) {
                log::info!(
                    "group `{}`: duration elapsed during ramp-up; {index} of {} user(s) started",
                    self.name,
                    model.users
                );
                break;
            }
            if !self.wait_until(run, at).await {
                return Ok(());
            }
            if !self.spawn_user(run, IterationGate::new(model.loops, deadline))? {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = run.tokens.graceful.cancelled() => return Ok(()),
                _ = sleep_until_deadline(deadline) => {
                    log::info!("group `{}`: duration elapsed", self.name);
                    return Ok(());
                }
                joined = run.tasks.join_next() => match joined {
                    Some(joined) => run.report.record(joined),
                    None => return Ok(()),
                },
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
