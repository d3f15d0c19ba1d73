//! Thread group scheduler: spawns, tracks and stops the virtual users of one group.

mod closed;
mod open;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConcurrencyModel, EngineConfig, ThreadGroupConfig};
use crate::context::VuContext;
use crate::error::{Error, Result};
use crate::gate::IterationGate;
use crate::pacing::{PacingEnv, PacingTimer, ThroughputSlot};
use crate::registry::PlanFactory;
use crate::sink::ResultSink;
use crate::vu::{RunTokens, UserReport, UserState, VirtualUser};

/// Extra time after `interrupt_grace` before the group aborts users that are still running.
const ABANDON_MARGIN: Duration = Duration::from_millis(50);

/// Lifecycle of a thread group run. Only moves forward within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Summary of one finished group run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub name: String,
    pub spawned: u64,
    pub completed: u64,
    pub interrupted: u64,
    /// Users abandoned because they did not honour an interrupt in time.
    pub force_terminated: u64,
    pub iterations: u64,
    pub fatal_users: u64,
    /// Scheduler-level failure that ended the run early.
    pub failure: Option<String>,
}

impl GroupReport {
    fn record(&mut self, joined: std::result::Result<UserReport, JoinError>) {
        match joined {
            Ok(report) => {
                match report.state {
                    UserState::Interrupted => self.interrupted += 1,
                    _ => self.completed += 1,
                }
                if report.forced {
                    self.force_terminated += 1;
                }
                if report.fatal.is_some() {
                    self.fatal_users += 1;
                }
                self.iterations += report.iterations;
            }
            Err(e) if e.is_panic() => {
                log::error!("group `{}`: virtual user panicked: {e}", self.name);
                self.interrupted += 1;
                self.fatal_users += 1;
            }
            Err(_) => self.force_terminated += 1,
        }
    }
}

/// Handles a group shares with the engine that owns it.
#[derive(Clone)]
pub(crate) struct GroupEnv {
    pub sink: Arc<dyn ResultSink>,
    pub policy: EngineConfig,
    pub engine_active: Arc<AtomicU64>,
    pub engine_slot: Arc<ThroughputSlot>,
}

struct LiveUser {
    graceful: CancellationToken,
    hard: CancellationToken,
    state: Arc<AtomicU8>,
}

struct GroupShared {
    config: ThreadGroupConfig,
    name: Arc<str>,
    plan: Arc<dyn PlanFactory>,
    env: GroupEnv,

    state_tx: watch::Sender<RunState>,
    live: DashMap<u64, LiveUser>,
    group_active: Arc<AtomicU64>,
    group_slot: Arc<ThroughputSlot>,
    next_user: AtomicU64,

    // Held while checking the stop flag and spawning, and while requesting a stop,
    // so no user is spawned once the group has left `Running`.
    spawn_gate: Mutex<()>,
    run: Mutex<Option<Arc<RunTokens>>>,
    report: Mutex<Option<GroupReport>>,
}

/// State of one run, owned by the coordination task.
struct GroupRun {
    tokens: Arc<RunTokens>,
    tasks: JoinSet<UserReport>,
    report: GroupReport,
}

/// Scheduler for one thread group. Cheap to clone.
#[derive(Clone)]
pub struct ThreadGroup(Arc<GroupShared>);

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("name", &self.0.name)
            .field("state", &self.state())
            .field("active_users", &self.active_users())
            .finish()
    }
}

impl ThreadGroup {
    /// Standalone group with its own sink and stop policy.
    pub fn new(
        config: ThreadGroupConfig,
        plan: Arc<dyn PlanFactory>,
        sink: Arc<dyn ResultSink>,
        policy: EngineConfig,
    ) -> Result<Self> {
        Self::with_env(
            config,
            plan,
            GroupEnv {
                sink,
                policy,
                engine_active: Arc::new(AtomicU64::new(0)),
                engine_slot: Arc::new(ThroughputSlot::default()),
            },
        )
    }

    pub(crate) fn with_env(
        config: ThreadGroupConfig,
        plan: Arc<dyn PlanFactory>,
        env: GroupEnv,
    ) -> Result<Self> {
        config.validate()?;
        let name = Arc::from(config.name.as_str());
        let (state_tx, _) = watch::channel(RunState::Idle);
        Ok(Self(Arc::new(GroupShared {
            config,
            name,
            plan,
            env,
            state_tx,
            live: DashMap::new(),
            group_active: Arc::new(AtomicU64::new(0)),
            group_slot: Arc::new(ThroughputSlot::default()),
            next_user: AtomicU64::new(1),
            spawn_gate: Mutex::new(()),
            run: Mutex::new(None),
            report: Mutex::new(None),
        })))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn config(&self) -> &ThreadGroupConfig {
        &self.0.config
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        *self.0.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.0.state_tx.subscribe()
    }

    /// Users spawned and not yet exited.
    #[must_use]
    pub fn active_users(&self) -> u64 {
        self.0.group_active.load(Ordering::Relaxed)
    }

    /// Users currently inside their iteration loop.
    #[must_use]
    pub fn running_users(&self) -> u64 {
        self.0
            .live
            .iter()
            .filter(|u| UserState::from_u8(u.state.load(Ordering::Acquire)) == UserState::Running)
            .count() as u64
    }

    /// Report of the last finished run.
    #[must_use]
    pub fn report(&self) -> Option<GroupReport> {
        self.0.report.lock().clone()
    }

    /// Starts a run on a dedicated coordination task. A terminated group can be started again.
    pub fn start(&self) -> Result<()> {
        let tokens = {
            let mut run = self.0.run.lock();
            match self.state() {
                RunState::Idle | RunState::Terminated => {}
                _ => return Err(Error::GroupRunning(self.0.name.to_string())),
            }
            let tokens = Arc::new(RunTokens::default());
            *run = Some(tokens.clone());
            self.0.report.lock().take();
            self.0.next_user.store(1, Ordering::Relaxed);
            self.0.state_tx.send_replace(RunState::Starting);
            tokens
        };

        log::info!(
            "group `{}`: starting ({} model)",
            self.0.name,
            self.0.config.model.kind()
        );
        let shared = self.0.clone();
        tokio::spawn(async move { shared.coordinate(tokens).await });
        Ok(())
    }

    /// Asks the current run to stop; returns immediately. Repeated calls only escalate.
    pub fn request_stop(&self, graceful: bool) {
        let Some(tokens) = self.0.run.lock().clone() else {
            return;
        };
        let _gate = self.0.spawn_gate.lock();
        if matches!(self.state(), RunState::Idle | RunState::Terminated) {
            return;
        }
        tokens.request_stop(graceful);
        self.0.advance(RunState::Stopping);
    }

    /// Stops one user; `false` if it is not live.
    pub fn stop_user(&self, user: u64, now: bool) -> bool {
        let Some(live) = self.0.live.get(&user) else {
            return false;
        };
        if now {
            live.hard.cancel();
        }
        live.graceful.cancel();
        true
    }

    pub async fn stop(&self, graceful: bool) -> Option<GroupReport> {
        self.request_stop(graceful);
        self.wait_terminated().await
    }

    /// Waits until the current run (if any) has terminated.
    pub async fn wait_terminated(&self) -> Option<GroupReport> {
        let mut rx = self.0.state_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx
            .wait_for(|s| matches!(s, RunState::Idle | RunState::Terminated))
            .await;
        self.report()
    }
}

impl GroupShared {
    fn advance(&self, next: RunState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            log::info!("group `{}`: {next}", self.name);
        }
    }

    async fn coordinate(self: Arc<Self>, tokens: Arc<RunTokens>) {
        let mut run = GroupRun {
            tokens,
            tasks: JoinSet::new(),
            report: GroupReport {
                name: self.name.to_string(),
                ..GroupReport::default()
            },
        };

        let result = match &self.config.model {
            ConcurrencyModel::Closed(model) => self.run_closed(model, &mut run).await,
            ConcurrencyModel::Open(model) => self.run_open(model, &mut run).await,
        };
        if let Err(e) = result {
            log::error!("group `{}`: {e}", self.name);
            run.report.failure = Some(e.to_string());
        }

        self.drain(&mut run).await;

        log::info!(
            "group `{}`: {} user(s) spawned, {} completed, {} interrupted, {} force-terminated",
            self.name,
            run.report.spawned,
            run.report.completed,
            run.report.interrupted,
            run.report.force_terminated
        );
        *self.report.lock() = Some(run.report);
        self.advance(RunState::Terminated);
    }

    /// Spawns one user; `Ok(false)` once the run is stopping.
    fn spawn_user(self: &Arc<Self>, run: &mut GroupRun, gate: IterationGate) -> Result<bool> {
        let root = self
            .plan
            .build()
            .map_err(|e| Error::Plan(format!("failed to build the test plan: {e}")))?;

        let _gate = self.spawn_gate.lock();
        if run.tokens.graceful.is_cancelled() {
            return Ok(false);
        }

        let id = self.next_user.fetch_add(1, Ordering::Relaxed);
        let graceful = run.tokens.graceful.child_token();
        let hard = run.tokens.hard.child_token();
        let state = Arc::new(AtomicU8::new(UserState::Created as u8));
        self.live.insert(
            id,
            LiveUser {
                graceful: graceful.clone(),
                hard: hard.clone(),
                state: state.clone(),
            },
        );
        let guard = ActiveUserGuard::new(self.clone(), id, state.clone());

        let seed = self.config.seed.map(|s| s.wrapping_add(id));
        let ctx = VuContext::new(
            self.name.clone(),
            id,
            hard.clone(),
            self.env.sink.clone(),
            self.config.on_sample_error,
            self.config.seed,
        );
        let pacing = PacingTimer::new(
            self.config.pacing.clone(),
            PacingEnv {
                group_active: self.group_active.clone(),
                engine_active: self.env.engine_active.clone(),
                group_slot: self.group_slot.clone(),
                engine_slot: self.env.engine_slot.clone(),
            },
            seed,
        );
        let user = VirtualUser {
            id,
            root,
            ctx,
            gate,
            pacing,
            graceful,
            hard,
            group: run.tokens.clone(),
            on_error: self.config.on_sample_error,
            interrupt_grace: self.env.policy.interrupt_grace,
            state,
        };

        run.tasks.spawn(async move {
            let _guard = guard;
            user.run().await
        });
        run.report.spawned += 1;
        Ok(true)
    }

    /// Stop protocol: graceful wait, then interrupt, then abandon.
    async fn drain(&self, run: &mut GroupRun) {
        {
            let _gate = self.spawn_gate.lock();
            run.tokens.graceful.cancel();
        }
        self.advance(RunState::Stopping);

        if !run.tokens.hard.is_cancelled() {
            let deadline = Instant::now() + self.env.policy.stop_timeout;
            loop {
                tokio::select! {
                    biased;
                    joined = run.tasks.join_next() => match joined {
                        Some(joined) => run.report.record(joined),
                        None => return,
                    },
                    _ = run.tokens.hard.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        log::warn!(
                            "group `{}`: {} user(s) still running after {:?}; interrupting",
                            self.name,
                            run.tasks.len(),
                            self.env.policy.stop_timeout
                        );
                        break;
                    }
                }
            }
        }

        run.tokens.hard.cancel();
        // Users start their own grace when they observe the cancel; wait past it so they can
        // report the abandoned iteration themselves.
        let deadline = Instant::now() + self.env.policy.interrupt_grace + ABANDON_MARGIN;
        loop {
            tokio::select! {
                biased;
                joined = run.tasks.join_next() => match joined {
                    Some(joined) => run.report.record(joined),
                    None => return,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let stuck = run.tasks.len() as u64;
        if stuck == 0 {
            return;
        }
        log::warn!(
            "group `{}`: abandoning {stuck} user(s) that ignored the interrupt",
            self.name
        );
        run.report.force_terminated += stuck;
        run.tasks.abort_all();
        run.tasks.detach_all();
    }

    /// Waits until `at`, collecting users that exit meanwhile. `false` if a stop was requested.
    async fn wait_until(&self, run: &mut GroupRun, at: Instant) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = run.tokens.graceful.cancelled() => return false,
                _ = tokio::time::sleep_until(at) => return true,
                Some(joined) = run.tasks.join_next() => run.report.record(joined),
            }
        }
    }
}

/// Keeps the live registry and active counters in sync with a user task.
struct ActiveUserGuard {
    group: Arc<GroupShared>,
    user: u64,
    state: Arc<AtomicU8>,
}

impl ActiveUserGuard {
    fn new(group: Arc<GroupShared>, user: u64, state: Arc<AtomicU8>) -> Self {
        group.group_active.fetch_add(1, Ordering::Relaxed);
        group.env.engine_active.fetch_add(1, Ordering::Relaxed);
        Self { group, user, state }
    }
}

impl Drop for ActiveUserGuard {
    fn drop(&mut self) {
        // An abandoned task from an earlier run may drop after its id was reused.
        self.group
            .live
            .remove_if(&self.user, |_, live| Arc::ptr_eq(&live.state, &self.state));
        self.group.group_active.fetch_sub(1, Ordering::Relaxed);
        self.group.env.engine_active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClosedModel;
    use crate::registry::plan_fn;
    use crate::sink::MemorySink;
    use crate::unit::{Dummy, UnitOfWork};

    fn live_user(state: &Arc<AtomicU8>) -> LiveUser {
        LiveUser {
            graceful: CancellationToken::new(),
            hard: CancellationToken::new(),
            state: state.clone(),
        }
    }

    #[test]
    fn stale_guard_leaves_a_reused_id_alone() {
        let group = ThreadGroup::new(
            ThreadGroupConfig::closed("g", ClosedModel::new(1)),
            plan_fn(|| Ok(Arc::new(Dummy::new("req")) as Arc<dyn UnitOfWork>)),
            MemorySink::new(),
            EngineConfig::default(),
        )
        .unwrap_or_else(|e| panic!("{e}"));
        let shared = group.0.clone();

        let old_state = Arc::new(AtomicU8::new(UserState::Running as u8));
        let stale = ActiveUserGuard::new(shared.clone(), 1, old_state);

        // A later run handed id 1 to a new user before the old task was dropped.
        let new_state = Arc::new(AtomicU8::new(UserState::Running as u8));
        shared.live.insert(1, live_user(&new_state));
        let current = ActiveUserGuard::new(shared.clone(), 1, new_state);
        assert_eq!(group.active_users(), 2);

        drop(stale);
        assert!(shared.live.contains_key(&1));
        assert_eq!(group.running_users(), 1);

        drop(current);
        assert!(!shared.live.contains_key(&1));
        assert_eq!(group.active_users(), 0);
    }
}
