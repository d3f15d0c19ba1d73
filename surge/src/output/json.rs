use std::io::Write as _;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use surge_core::{EngineConfig, EngineReport, SampleEvent, ThreadGroupConfig, Value};

use super::{OutputFormatter, SampleTotals};

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_header(&self, _group: &ThreadGroupConfig, _policy: &EngineConfig) {}

    fn sample(&self, event: &SampleEvent) {
        emit_json_line(&build_sample_line(event));
    }

    fn print_summary(&self, report: &EngineReport, totals: &SampleTotals) -> anyhow::Result<()> {
        emit_json_line(&build_summary_line(report, totals));
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonSampleLine<'a> {
    pub kind: &'static str,
    pub group: &'a str,
    pub user: u64,
    pub iteration: u64,
    pub label: &'a str,
    pub success: bool,
    pub started_at_ms: u64,
    pub elapsed_ms: f64,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonGroupLine<'a> {
    pub name: &'a str,
    pub spawned: u64,
    pub completed: u64,
    pub interrupted: u64,
    pub force_terminated: u64,
    pub iterations: u64,
    pub fatal_users: u64,
    pub failure: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonSummaryLine<'a> {
    pub kind: &'static str,
    pub samples_total: u64,
    pub samples_failed: u64,
    pub latency_mean_ms: f64,
    pub latency_max_ms: f64,
    pub groups: Vec<JsonGroupLine<'a>>,
    pub failure: Option<&'a str>,
}

fn build_sample_line(event: &SampleEvent) -> JsonSampleLine<'_> {
    let started_at_ms = event
        .started_at
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    JsonSampleLine {
        kind: "sample",
        group: &event.group,
        user: event.user,
        iteration: event.iteration,
        label: &event.label,
        success: event.success,
        started_at_ms,
        elapsed_ms: event.elapsed.as_secs_f64() * 1000.0,
        payload: to_json(&event.payload),
        message: event.message.as_deref(),
    }
}

fn build_summary_line<'a>(report: &'a EngineReport, totals: &SampleTotals) -> JsonSummaryLine<'a> {
    JsonSummaryLine {
        kind: "summary",
        samples_total: totals.total,
        samples_failed: totals.failed,
        latency_mean_ms: totals.mean().as_secs_f64() * 1000.0,
        latency_max_ms: totals.elapsed_max.as_secs_f64() * 1000.0,
        groups: report
            .groups
            .iter()
            .map(|g| JsonGroupLine {
                name: &g.name,
                spawned: g.spawned,
                completed: g.completed,
                interrupted: g.interrupted,
                force_terminated: g.force_terminated,
                iterations: g.iterations,
                fatal_users: g.fatal_users,
                failure: g.failure.as_deref(),
            })
            .collect(),
        failure: report.failure.as_deref(),
    }
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I64(n) => serde_json::Value::from(*n),
        Value::U64(n) => serde_json::Value::from(*n),
        Value::F64(n) => serde_json::Number::from_f64(*n)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) => serde_json::Value::String(s.to_string()),
        Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), to_json(v)))
                .collect(),
        ),
    }
}

fn emit_json_line<T: Serialize>(line: &T) {
    let mut out = std::io::stdout().lock();
    match serde_json::to_writer(&mut out, line) {
        Ok(()) => {
            let _ = out.write_all(b"\n");
        }
        Err(e) => log::error!("failed to encode output line: {e}"),
    }
}
