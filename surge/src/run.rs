use std::sync::Arc;

use anyhow::anyhow;
use surge_core::{
    ChannelSink, DEFAULT_INTERRUPT_GRACE, DEFAULT_STOP_TIMEOUT, Engine, EngineConfig, PlanNode,
    RegistryPlan, SampleEvent, ThreadGroupOptions, UnitRegistry,
};
use tokio::sync::mpsc;

use crate::cli::RunArgs;
use crate::exit_codes::ExitCode;
use crate::output::{self, OutputFormatter, SampleTotals};
use crate::run_error::RunError;

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let config = group_options(&args)
        .into_config()
        .map_err(|e| RunError::InvalidInput(e.into()))?;
    let policy = EngineConfig {
        stop_timeout: args.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT),
        interrupt_grace: args.interrupt_grace.unwrap_or(DEFAULT_INTERRUPT_GRACE),
    };
    let plan = Arc::new(RegistryPlan::new(
        Arc::new(UnitRegistry::builtin()),
        sampler_node(&args),
    ));

    let out: Arc<dyn OutputFormatter> = Arc::from(output::formatter(args.output));
    out.print_header(&config, &policy);

    let (sink, rx) = ChannelSink::new();
    let mut engine = Engine::new(policy, sink);
    engine
        .add_group(config, plan)
        .map_err(|e| RunError::InvalidInput(e.into()))?;
    let engine = Arc::new(engine);

    let printer = tokio::spawn(consume_samples(rx, out.clone()));
    engine
        .start()
        .map_err(|e| RunError::RuntimeError(e.into()))?;
    let signals = tokio::spawn(forward_signals(engine.clone()));

    let report = engine.wait().await.unwrap_or_default();
    signals.abort();
    // The sink is closed once the engine terminates, which ends the printer.
    let totals = printer
        .await
        .map_err(|e| RunError::RuntimeError(anyhow!("sample printer failed: {e}")))?;

    out.print_summary(&report, &totals)
        .map_err(RunError::RuntimeError)?;

    if let Some(failure) = report.failure {
        return Err(RunError::RuntimeError(anyhow!("run failed: {failure}")));
    }
    Ok(ExitCode::from_samples(totals.failed))
}

fn group_options(args: &RunArgs) -> ThreadGroupOptions {
    ThreadGroupOptions {
        name: Some(args.name.clone()),
        model: args.model.clone(),
        users: args.users,
        ramp_up: args.ramp_up,
        loops: args.loops,
        duration: args.duration,
        delay: args.delay,
        schedule: args.schedule.clone(),
        distribution: args.distribution.clone(),
        pacing: args.pacing.clone(),
        on_error: args.on_error.clone(),
        seed: args.seed,
    }
}

/// The synthetic sampler every virtual user runs.
fn sampler_node(args: &RunArgs) -> PlanNode {
    PlanNode::new("dummy")
        .label("sample")
        .param("latency", args.latency.as_secs_f64())
        .param("error_rate", args.error_rate)
}

async fn consume_samples(
    mut rx: mpsc::UnboundedReceiver<SampleEvent>,
    out: Arc<dyn OutputFormatter>,
) -> SampleTotals {
    let mut totals = SampleTotals::default();
    while let Some(event) = rx.recv().await {
        totals.record(&event);
        out.sample(&event);
    }
    totals
}

/// First Ctrl-C stops gracefully, the second one interrupts in-flight work.
async fn forward_signals(engine: Arc<Engine>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    log::warn!("interrupt received; stopping gracefully (press Ctrl-C again to stop now)");
    engine.stop(true);

    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    log::warn!("second interrupt received; stopping now");
    engine.stop(false);
}
