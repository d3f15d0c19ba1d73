use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::{EngineConfig, ThreadGroupConfig};
use crate::error::{Error, Result};
use crate::group::{GroupEnv, GroupReport, ThreadGroup};
use crate::pacing::ThroughputSlot;
use crate::registry::PlanFactory;
use crate::sink::ResultSink;

/// What `await_termination` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Termination {
    Completed,
    TimedOut,
}

/// Summary of one engine run, one entry per thread group in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub groups: Vec<GroupReport>,
    /// First scheduler-level failure; the remaining groups were stopped because of it.
    pub failure: Option<String>,
}

impl EngineReport {
    #[must_use]
    pub fn spawned(&self) -> u64 {
        self.groups.iter().map(|g| g.spawned).sum()
    }

    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.groups.iter().map(|g| g.iterations).sum()
    }

    #[must_use]
    pub fn force_terminated(&self) -> u64 {
        self.groups.iter().map(|g| g.force_terminated).sum()
    }
}

struct EngineShared {
    done_tx: watch::Sender<bool>,
    report: Mutex<Option<EngineReport>>,
}

/// Runs a set of thread groups together and closes the result sink once all of them terminate.
///
/// Groups are added with `&mut self`; everything after `start` takes `&self`, so a started engine
/// can be shared (e.g. behind an `Arc`) with a signal handler that calls `stop`.
pub struct Engine {
    config: EngineConfig,
    sink: Arc<dyn ResultSink>,
    groups: Vec<ThreadGroup>,
    engine_active: Arc<AtomicU64>,
    engine_slot: Arc<ThroughputSlot>,
    started: AtomicBool,
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("groups", &self.groups)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, sink: Arc<dyn ResultSink>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            config,
            sink,
            groups: Vec::new(),
            engine_active: Arc::new(AtomicU64::new(0)),
            engine_slot: Arc::new(ThroughputSlot::default()),
            started: AtomicBool::new(false),
            shared: Arc::new(EngineShared {
                done_tx,
                report: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates `config` and builds the plan once so a broken plan fails here, not mid-run.
    pub fn add_group(
        &mut self,
        config: ThreadGroupConfig,
        plan: Arc<dyn PlanFactory>,
    ) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::AlreadyStarted);
        }
        config.validate()?;
        if self.groups.iter().any(|g| g.name() == config.name) {
            return Err(Error::InvalidName {
                kind: "duplicate thread group name",
                input: config.name,
            });
        }
        plan.build()
            .map_err(|e| Error::Plan(format!("thread group `{}`: {e}", config.name)))?;

        let group = ThreadGroup::with_env(
            config,
            plan,
            GroupEnv {
                sink: self.sink.clone(),
                policy: self.config,
                engine_active: self.engine_active.clone(),
                engine_slot: self.engine_slot.clone(),
            },
        )?;
        self.groups.push(group);
        Ok(())
    }

    #[must_use]
    pub fn groups(&self) -> &[ThreadGroup] {
        &self.groups
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&ThreadGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    /// Users alive across all groups.
    #[must_use]
    pub fn active_users(&self) -> u64 {
        self.engine_active.load(Ordering::Relaxed)
    }

    /// Starts every group and a supervisor task that waits for all of them. An engine runs once.
    pub fn start(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::NoGroups);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        log::info!("engine: starting {} thread group(s)", self.groups.len());
        for (index, group) in self.groups.iter().enumerate() {
            if let Err(e) = group.start() {
                for started in &self.groups[..index] {
                    started.request_stop(false);
                }
                return Err(e);
            }
        }

        let groups = self.groups.clone();
        let sink = self.sink.clone();
        let shared = self.shared.clone();
        tokio::spawn(supervise(groups, sink, shared));
        Ok(())
    }

    /// Stops every group. Graceful lets current iterations finish; otherwise in-flight work is
    /// interrupted. Returns immediately; repeated calls only escalate.
    pub fn stop(&self, graceful: bool) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        log::info!(
            "engine: {} stop requested",
            if graceful { "graceful" } else { "immediate" }
        );
        for group in &self.groups {
            group.request_stop(graceful);
        }
    }

    /// Waits until every group has terminated and the sink is closed, or `timeout` elapses.
    ///
    /// An engine that was never started has nothing to wait for and reports `Completed`.
    pub async fn await_termination(&self, timeout: Duration) -> Termination {
        if !self.started.load(Ordering::Acquire) {
            return Termination::Completed;
        }
        match tokio::time::timeout(timeout, self.wait_done()).await {
            Ok(()) => Termination::Completed,
            Err(_) => Termination::TimedOut,
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.shared.done_tx.borrow()
    }

    /// Report of the finished run.
    #[must_use]
    pub fn report(&self) -> Option<EngineReport> {
        self.shared.report.lock().clone()
    }

    /// Waits without a timeout; `None` if the engine was never started.
    pub async fn wait(&self) -> Option<EngineReport> {
        if !self.started.load(Ordering::Acquire) {
            return None;
        }
        self.wait_done().await;
        self.report()
    }

    /// Starts the engine and waits for it to finish.
    pub async fn run(&self) -> Result<EngineReport> {
        self.start()?;
        Ok(self.wait().await.unwrap_or_default())
    }

    async fn wait_done(&self) {
        let mut rx = self.shared.done_tx.subscribe();
        // `shared` keeps the sender alive.
        let _ = rx.wait_for(|done| *done).await;
    }
}

async fn supervise(groups: Vec<ThreadGroup>, sink: Arc<dyn ResultSink>, shared: Arc<EngineShared>) {
    let mut waits = JoinSet::new();
    for (index, group) in groups.iter().cloned().enumerate() {
        waits.spawn(async move { (index, group.wait_terminated().await) });
    }

    let mut reports: Vec<Option<GroupReport>> = vec![None; groups.len()];
    let mut failure: Option<String> = None;
    while let Some(joined) = waits.join_next().await {
        match joined {
            Ok((index, report)) => {
                let failed = report.as_ref().and_then(|r| r.failure.clone());
                if let Some(reason) = failed
                    && failure.is_none()
                {
                    log::error!(
                        "engine: group `{}` failed ({reason}); stopping the remaining groups",
                        groups[index].name()
                    );
                    failure = Some(format!("group `{}`: {reason}", groups[index].name()));
                    for group in &groups {
                        group.request_stop(true);
                    }
                }
                reports[index] = report;
            }
            Err(e) => {
                log::error!("engine: supervisor task failed: {e}");
                failure.get_or_insert_with(|| Error::Join(e).to_string());
                for group in &groups {
                    group.request_stop(false);
                }
            }
        }
    }

    sink.close();
    let report = EngineReport {
        groups: reports.into_iter().flatten().collect(),
        failure,
    };
    log::info!(
        "engine: terminated; {} user(s) spawned, {} iteration(s), {} force-terminated",
        report.spawned(),
        report.iterations(),
        report.force_terminated()
    );
    *shared.report.lock() = Some(report);
    shared.done_tx.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClosedModel;
    use crate::registry::plan_fn;
    use crate::sink::MemorySink;
    use crate::unit::{Dummy, UnitOfWork};

    fn plan() -> Arc<dyn PlanFactory> {
        plan_fn(|| {
            let unit: Arc<dyn UnitOfWork> =
                Arc::new(Dummy::new("req").latency(Duration::from_millis(10)));
            Ok(unit)
        })
    }

    fn closed(name: &str, loops: u64) -> ThreadGroupConfig {
        ThreadGroupConfig::closed(
            name,
            ClosedModel {
                loops: Some(loops),
                ..ClosedModel::new(2)
            },
        )
    }

    #[test]
    fn add_group_rejects_duplicates_and_broken_plans() {
        let mut engine = Engine::new(EngineConfig::default(), MemorySink::new());
        engine
            .add_group(closed("a", 1), plan())
            .unwrap_or_else(|e| panic!("{e}"));

        assert!(matches!(
            engine.add_group(closed("a", 1), plan()),
            Err(Error::InvalidName { .. })
        ));
        assert!(matches!(
            engine.add_group(
                closed("b", 1),
                plan_fn(|| Err(Error::UnknownUnit("http".to_string())))
            ),
            Err(Error::Plan(_))
        ));
        assert_eq!(engine.groups().len(), 1);
    }

    #[tokio::test]
    async fn start_requires_groups_and_runs_once() {
        let engine = Engine::new(EngineConfig::default(), MemorySink::new());
        assert!(matches!(engine.start(), Err(Error::NoGroups)));
        assert_eq!(
            engine.await_termination(Duration::from_millis(1)).await,
            Termination::Completed
        );

        let mut engine = Engine::new(EngineConfig::default(), MemorySink::new());
        engine
            .add_group(closed("a", 1), plan())
            .unwrap_or_else(|e| panic!("{e}"));
        engine.start().unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(engine.start(), Err(Error::AlreadyStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_for_every_group_and_closes_the_sink() {
        let sink = MemorySink::new();
        let mut engine = Engine::new(EngineConfig::default(), sink.clone());
        engine
            .add_group(closed("a", 3), plan())
            .unwrap_or_else(|e| panic!("{e}"));
        engine
            .add_group(closed("b", 1), plan())
            .unwrap_or_else(|e| panic!("{e}"));

        let report = engine.run().await.unwrap_or_else(|e| panic!("{e}"));
        assert!(engine.is_terminated());
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].name, "a");
        assert_eq!(report.groups[0].iterations, 6);
        assert_eq!(report.groups[1].iterations, 2);
        assert_eq!(report.failure, None);
        assert_eq!(sink.len(), 8);
        assert_eq!(sink.close_count(), 1);
        assert_eq!(engine.active_users(), 0);
    }
}
