use std::time::Duration;

use surge_core::{EngineConfig, EngineReport, SampleEvent, ThreadGroupConfig};

use crate::cli::OutputFormat;

mod human;
mod json;

/// Running totals over every sample the sink delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SampleTotals {
    pub total: u64,
    pub failed: u64,
    pub elapsed_sum: Duration,
    pub elapsed_max: Duration,
}

impl SampleTotals {
    pub(crate) fn record(&mut self, event: &SampleEvent) {
        self.total += 1;
        if !event.success {
            self.failed += 1;
        }
        self.elapsed_sum = self.elapsed_sum.saturating_add(event.elapsed);
        self.elapsed_max = self.elapsed_max.max(event.elapsed);
    }

    pub(crate) fn mean(&self) -> Duration {
        match u32::try_from(self.total) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.elapsed_sum / n,
            Err(_) => Duration::from_secs_f64(self.elapsed_sum.as_secs_f64() / self.total as f64),
        }
    }
}

pub(crate) trait OutputFormatter: Send + Sync {
    fn print_header(&self, group: &ThreadGroupConfig, policy: &EngineConfig);
    fn sample(&self, event: &SampleEvent);
    fn print_summary(&self, report: &EngineReport, totals: &SampleTotals) -> anyhow::Result<()>;
}

pub(crate) fn formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::HumanReadable => Box::new(human::HumanReadableOutput),
        OutputFormat::Json => Box::new(json::JsonOutput),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::SystemTime;

    use surge_core::Value;

    use super::*;

    fn event(success: bool, elapsed_ms: u64) -> SampleEvent {
        SampleEvent {
            group: Arc::from("g"),
            user: 1,
            iteration: 0,
            label: Arc::from("req"),
            success,
            started_at: SystemTime::UNIX_EPOCH,
            elapsed: Duration::from_millis(elapsed_ms),
            payload: Value::Null,
            message: None,
        }
    }

    #[test]
    fn totals_track_failures_and_latency() {
        let mut totals = SampleTotals::default();
        assert_eq!(totals.mean(), Duration::ZERO);

        totals.record(&event(true, 10));
        totals.record(&event(false, 30));
        totals.record(&event(true, 20));
        assert_eq!(totals.total, 3);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.mean(), Duration::from_millis(20));
        assert_eq!(totals.elapsed_max, Duration::from_millis(30));
    }
}
