use std::time::Duration;

use surge_core::{ConcurrencyModel, EngineConfig, EngineReport, SampleEvent, ThreadGroupConfig};

use super::{OutputFormatter, SampleTotals};

pub(crate) struct HumanReadableOutput;

fn format_latency(d: Duration) -> String {
    // Truncated to microseconds.
    humantime::format_duration(Duration::from_micros(d.as_micros() as u64)).to_string()
}

fn describe(group: &ThreadGroupConfig) -> String {
    match &group.model {
        ConcurrencyModel::Closed(m) => {
            let mut out = format!("model=closed users={}", m.users);
            if !m.ramp_up.is_zero() {
                out.push_str(&format!(" ramp_up={}", humantime::format_duration(m.ramp_up)));
            }
            if let Some(loops) = m.loops {
                out.push_str(&format!(" loops={loops}"));
            }
            if let Some(duration) = m.duration {
                out.push_str(&format!(" duration={}", humantime::format_duration(duration)));
            }
            if !m.delay_before_start.is_zero() {
                out.push_str(&format!(
                    " delay={}",
                    humantime::format_duration(m.delay_before_start)
                ));
            }
            out
        }
        ConcurrencyModel::Open(m) => {
            format!("model=open schedule=\"{}\" distribution={}", m.schedule, m.distribution)
        }
    }
}

impl OutputFormatter for HumanReadableOutput {
    fn print_header(&self, group: &ThreadGroupConfig, policy: &EngineConfig) {
        println!("group: {} {}", group.name, describe(group));
        println!(
            "pacing: {} on_error={} stop_timeout={} interrupt_grace={}",
            group.pacing,
            group.on_sample_error,
            humantime::format_duration(policy.stop_timeout),
            humantime::format_duration(policy.interrupt_grace)
        );
        println!();
    }

    fn sample(&self, _event: &SampleEvent) {}

    fn print_summary(&self, report: &EngineReport, totals: &SampleTotals) -> anyhow::Result<()> {
        for g in &report.groups {
            println!(
                "group {}: users={} completed={} interrupted={} force_terminated={} iterations={}",
                g.name, g.spawned, g.completed, g.interrupted, g.force_terminated, g.iterations
            );
            if g.fatal_users > 0 {
                println!("  fatal users: {}", g.fatal_users);
            }
            if let Some(failure) = &g.failure {
                println!("  failed: {failure}");
            }
        }
        println!();
        println!(
            "samples: {} total, {} failed, latency mean {} max {}",
            totals.total,
            totals.failed,
            format_latency(totals.mean()),
            format_latency(totals.elapsed_max)
        );
        Ok(())
    }
}
