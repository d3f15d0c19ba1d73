use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::OnSampleError;
use crate::context::VuContext;
use crate::gate::IterationGate;
use crate::pacing::{PacingTimer, PreviousIteration};
use crate::unit::UnitOfWork;

/// Lifecycle of one virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[repr(u8)]
pub enum UserState {
    Created = 0,
    Running = 1,
    Completed = 2,
    Interrupted = 3,
}

impl UserState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Completed,
            _ => Self::Interrupted,
        }
    }
}

/// How a virtual user ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserReport {
    pub user: u64,
    pub state: UserState,
    pub iterations: u64,
    /// The last iteration ignored the interrupt and was abandoned.
    pub forced: bool,
    pub fatal: Option<String>,
}

/// Stop requests shared by every user of one group run.
#[derive(Debug, Default)]
pub(crate) struct RunTokens {
    pub graceful: CancellationToken,
    pub hard: CancellationToken,
}

impl RunTokens {
    pub fn request_stop(&self, graceful: bool) {
        self.graceful.cancel();
        if !graceful {
            self.hard.cancel();
        }
    }
}

pub(crate) struct VirtualUser {
    pub id: u64,
    pub root: Arc<dyn UnitOfWork>,
    pub ctx: VuContext,
    pub gate: IterationGate,
    pub pacing: PacingTimer,
    /// Per-user children of the group tokens.
    pub graceful: CancellationToken,
    pub hard: CancellationToken,
    pub group: Arc<RunTokens>,
    pub on_error: OnSampleError,
    pub interrupt_grace: Duration,
    pub state: Arc<AtomicU8>,
}

enum Iteration {
    Finished,
    Abandoned,
}

impl VirtualUser {
    fn set_state(&self, state: UserState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub async fn run(mut self) -> UserReport {
        self.set_state(UserState::Running);
        log::debug!("group `{}` user {}: started", self.ctx.group(), self.id);

        let mut iterations = 0u64;
        let mut forced = false;
        let mut previous: Option<PreviousIteration> = None;

        let state = loop {
            if self.hard.is_cancelled() {
                break UserState::Interrupted;
            }
            if self.graceful.is_cancelled() || !self.gate.next(Instant::now()) {
                break UserState::Completed;
            }

            if let Some(prev) = &previous {
                let delay = self.pacing.delay(prev, Instant::now());
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = self.hard.cancelled() => break UserState::Interrupted,
                        _ = self.graceful.cancelled() => break UserState::Completed,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if self.gate.deadline().is_some_and(|d| Instant::now() >= d) {
                        break UserState::Completed;
                    }
                }
            }

            self.ctx.begin_iteration(iterations);
            let started = Instant::now();
            let started_at = SystemTime::now();
            if let Iteration::Abandoned = self.iterate().await {
                log::warn!(
                    "group `{}` user {}: `{}` ignored the interrupt for {:?}; abandoning it",
                    self.ctx.group(),
                    self.id,
                    self.root.label(),
                    self.interrupt_grace
                );
                self.ctx
                    .abandon(self.root.label(), started_at, started.elapsed());
                forced = true;
                break UserState::Interrupted;
            }
            iterations += 1;
            previous = Some(PreviousIteration { started });

            if self.ctx.fatal().is_some() {
                break UserState::Completed;
            }
            if self.hard.is_cancelled() {
                break UserState::Interrupted;
            }
            if self.ctx.sample_failed() {
                match self.on_error {
                    OnSampleError::Continue | OnSampleError::StartNextLoop => {}
                    OnSampleError::StopUser => break UserState::Completed,
                    OnSampleError::StopGroup => {
                        log::info!(
                            "group `{}` user {}: sample failed; stopping group",
                            self.ctx.group(),
                            self.id
                        );
                        self.group.request_stop(true);
                        break UserState::Completed;
                    }
                    OnSampleError::StopGroupNow => {
                        log::info!(
                            "group `{}` user {}: sample failed; stopping group now",
                            self.ctx.group(),
                            self.id
                        );
                        self.group.request_stop(false);
                        break UserState::Completed;
                    }
                }
            }
        };

        self.set_state(state);
        log::debug!(
            "group `{}` user {}: {state} after {iterations} iteration(s)",
            self.ctx.group(),
            self.id
        );
        UserReport {
            user: self.id,
            state,
            iterations,
            forced,
            fatal: self.ctx.fatal().map(str::to_string),
        }
    }

    /// Runs the root unit once, forwarding a hard interrupt to it.
    async fn iterate(&mut self) -> Iteration {
        let root = self.root.clone();
        let hard = self.hard.clone();
        let grace = self.interrupt_grace;

        let execution = self.ctx.execute(root.as_ref());
        tokio::pin!(execution);

        tokio::select! {
            biased;
            _ = &mut execution => Iteration::Finished,
            _ = hard.cancelled() => {
                root.interrupt();
                match tokio::time::timeout(grace, &mut execution).await {
                    Ok(_) => Iteration::Finished,
                    Err(_) => Iteration::Abandoned,
                }
            }
        }
    }
}
