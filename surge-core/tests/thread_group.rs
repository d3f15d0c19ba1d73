mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Deaf, Recorder};
use surge_core::{
    ClosedModel, Dummy, EngineConfig, MemorySink, RunState, ScheduleSpec, ThreadGroup,
    ThreadGroupConfig, UnitOfWork, plan_fn,
};
use tokio::time::Instant;

fn group(
    config: ThreadGroupConfig,
    plan: Arc<dyn surge_core::PlanFactory>,
    sink: Arc<MemorySink>,
) -> ThreadGroup {
    ThreadGroup::new(config, plan, sink, EngineConfig::default())
        .unwrap_or_else(|e| panic!("invalid group: {e}"))
}

fn slow_dummy(latency: Duration) -> Arc<dyn surge_core::PlanFactory> {
    plan_fn(move || Ok(Arc::new(Dummy::new("req").latency(latency)) as Arc<dyn UnitOfWork>))
}

#[tokio::test(start_paused = true)]
async fn closed_model_without_ramp_runs_every_user_at_once() {
    let sink = MemorySink::new();
    let g = group(
        ThreadGroupConfig::closed("pool", ClosedModel::new(5)),
        slow_dummy(Duration::from_secs(3600)),
        sink.clone(),
    );

    g.start().unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(g.state(), RunState::Running);
    assert_eq!(g.running_users(), 5);
    assert_eq!(g.active_users(), 5);

    let report = g.stop(false).await.unwrap_or_else(|| panic!("no report"));
    assert_eq!(g.state(), RunState::Terminated);
    assert_eq!(report.spawned, 5);
    assert_eq!(report.interrupted, 5);
    assert_eq!(report.force_terminated, 0);
    assert_eq!(g.active_users(), 0);

    let events = sink.events();
    assert_eq!(events.len(), 5);
    assert!(events.iter().all(|e| !e.success));
}

#[tokio::test(start_paused = true)]
async fn ramp_up_staggers_user_starts() {
    let recorder = Recorder::new(Duration::from_millis(10));
    let config = ThreadGroupConfig::closed(
        "ramp",
        ClosedModel {
            ramp_up: Duration::from_millis(400),
            loops: Some(1),
            ..ClosedModel::new(4)
        },
    );
    let g = group(config, recorder.plan(), MemorySink::new());

    g.start().unwrap_or_else(|e| panic!("{e}"));
    let report = g.wait_terminated().await.unwrap_or_else(|| panic!("no report"));
    assert_eq!(report.completed, 4);

    let mut seen = recorder.seen();
    seen.sort();
    let starts: Vec<_> = seen.iter().map(|(_, at)| at.as_millis()).collect();
    assert_eq!(starts, vec![0, 100, 200, 300]);
}

#[tokio::test(start_paused = true)]
async fn closed_duration_bounds_the_run() {
    let sink = MemorySink::new();
    let config = ThreadGroupConfig::closed(
        "timed",
        ClosedModel {
            duration: Some(Duration::from_secs(1)),
            ..ClosedModel::new(2)
        },
    );
    let g = group(config, slow_dummy(Duration::from_millis(300)), sink.clone());

    let t0 = Instant::now();
    g.start().unwrap_or_else(|e| panic!("{e}"));
    let report = g.wait_terminated().await.unwrap_or_else(|| panic!("no report"));

    // Iterations start at 0, 300, 600 and 900ms; the last one is allowed to finish.
    assert_eq!(report.iterations, 8);
    assert_eq!(report.completed, 2);
    assert_eq!(t0.elapsed(), Duration::from_millis(1200));
    assert!(sink.events().iter().all(|e| e.success));
}

#[tokio::test(start_paused = true)]
async fn delay_before_start_keeps_the_group_starting() {
    let recorder = Recorder::new(Duration::ZERO);
    let config = ThreadGroupConfig::closed(
        "late",
        ClosedModel {
            delay_before_start: Duration::from_millis(500),
            loops: Some(1),
            ..ClosedModel::new(1)
        },
    );
    let g = group(config, recorder.plan(), MemorySink::new());

    g.start().unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(g.state(), RunState::Starting);

    g.wait_terminated().await;
    assert_eq!(recorder.seen(), vec![(1, Duration::from_millis(500))]);
}

#[tokio::test(start_paused = true)]
async fn open_model_reference_schedule() {
    let recorder = Recorder::new(Duration::ZERO);
    let sink = MemorySink::new();
    let schedule: ScheduleSpec = "rate(50/sec) random_arrivals(100ms) pause(2s)"
        .parse()
        .unwrap_or_else(|e| panic!("{e}"));
    let g = group(
        ThreadGroupConfig::open("arrivals", schedule).with_seed(7),
        recorder.plan(),
        sink.clone(),
    );

    let t0 = Instant::now();
    g.start().unwrap_or_else(|e| panic!("{e}"));
    let report = g.wait_terminated().await.unwrap_or_else(|| panic!("no report"));

    // 50/sec over a 100ms window, then nothing during the pause.
    assert_eq!(report.spawned, 5);
    assert_eq!(report.iterations, 5);
    assert_eq!(sink.len(), 5);
    let seen = recorder.seen();
    assert_eq!(seen.len(), 5);
    assert!(seen.iter().all(|(_, at)| *at <= Duration::from_millis(100)));
    assert!(t0.elapsed() >= Duration::from_millis(2100));

    let mut users: Vec<u64> = sink.events().iter().map(|e| e.user).collect();
    users.sort_unstable();
    assert_eq!(users, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn open_model_arrivals_do_not_wait_for_running_users() {
    let sink = MemorySink::new();
    let schedule: ScheduleSpec = "rate(10/sec)".parse().unwrap_or_else(|e| panic!("{e}"));
    let g = group(
        ThreadGroupConfig::open("unbounded", schedule),
        slow_dummy(Duration::from_secs(3600)),
        sink.clone(),
    );

    g.start().unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(1050)).await;
    assert_eq!(g.active_users(), 10);

    let report = g.stop(false).await.unwrap_or_else(|| panic!("no report"));
    assert_eq!(report.spawned, 10);
    assert_eq!(report.interrupted, 10);
    assert_eq!(sink.len(), 10);
    assert!(sink.events().iter().all(|e| !e.success));
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_is_idempotent() {
    let sink = MemorySink::new();
    let g = group(
        ThreadGroupConfig::closed("steady", ClosedModel::new(3)),
        slow_dummy(Duration::from_millis(100)),
        sink.clone(),
    );

    g.start().unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(250)).await;
    g.request_stop(true);
    g.request_stop(true);
    let first = g.wait_terminated().await.unwrap_or_else(|| panic!("no report"));

    assert_eq!(first.completed, 3);
    assert_eq!(first.interrupted, 0);
    assert_eq!(first.iterations, 9);
    assert_eq!(sink.len(), 9);
    assert!(sink.events().iter().all(|e| e.success));

    let second = g.stop(true).await;
    assert_eq!(second.as_ref(), Some(&first));
    assert_eq!(g.state(), RunState::Terminated);
    assert_eq!(sink.len(), 9);
}

#[tokio::test(start_paused = true)]
async fn stop_user_only_affects_that_user() {
    let g = group(
        ThreadGroupConfig::closed("pair", ClosedModel::new(2)),
        slow_dummy(Duration::from_millis(100)),
        MemorySink::new(),
    );

    g.start().unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(g.stop_user(1, false));
    assert!(!g.stop_user(99, false));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(g.active_users(), 1);

    let report = g.stop(true).await.unwrap_or_else(|| panic!("no report"));
    assert_eq!(report.completed, 2);
}

#[tokio::test(start_paused = true)]
async fn terminated_group_can_run_again() {
    let sink = MemorySink::new();
    let config = ThreadGroupConfig::closed(
        "again",
        ClosedModel {
            loops: Some(2),
            ..ClosedModel::new(2)
        },
    );
    let g = group(config, slow_dummy(Duration::from_millis(10)), sink.clone());

    for _ in 0..2 {
        g.start().unwrap_or_else(|e| panic!("{e}"));
        assert!(g.start().is_err());
        let report = g.wait_terminated().await.unwrap_or_else(|| panic!("no report"));
        assert_eq!(report.iterations, 4);
    }
    assert_eq!(sink.len(), 8);
    assert!(sink.events().iter().all(|e| e.user == 1 || e.user == 2));
}

#[tokio::test(start_paused = true)]
async fn users_ignoring_the_interrupt_report_their_own_timeout() {
    let policy = EngineConfig {
        stop_timeout: Duration::from_millis(500),
        interrupt_grace: Duration::from_millis(100),
    };
    let sink = MemorySink::new();
    let g = ThreadGroup::new(
        ThreadGroupConfig::closed("stuck", ClosedModel::new(2)),
        plan_fn(|| Ok(Arc::new(Deaf) as Arc<dyn UnitOfWork>)),
        sink.clone(),
        policy,
    )
    .unwrap_or_else(|e| panic!("invalid group: {e}"));

    g.start().unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let t0 = Instant::now();
    let report = g.stop(false).await.unwrap_or_else(|| panic!("no report"));
    let elapsed = t0.elapsed();
    let margin = Duration::from_millis(50);
    assert!(
        elapsed >= policy.interrupt_grace && elapsed < policy.interrupt_grace + margin,
        "{elapsed:?}"
    );
    assert_eq!(report.interrupted, 2);
    assert_eq!(report.force_terminated, 2);
    assert_eq!(g.active_users(), 0);

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(
        events
            .iter()
            .all(|e| !e.success && e.message.as_deref() == Some("interrupt timeout"))
    );

    // The group can run again once the abandoned users are gone.
    g.start().unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(g.running_users(), 2);
    let report = g.stop(false).await.unwrap_or_else(|| panic!("no report"));
    assert_eq!(report.force_terminated, 2);
    assert_eq!(sink.len(), 4);
}
