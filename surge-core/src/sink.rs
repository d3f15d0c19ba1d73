use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use surge_value::Value;
use tokio::sync::mpsc;

/// Result of one sampler execution, as delivered to the result sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleEvent {
    pub group: Arc<str>,
    pub user: u64,
    pub iteration: u64,
    pub label: Arc<str>,
    pub success: bool,
    pub started_at: SystemTime,
    pub elapsed: Duration,
    pub payload: Value,
    pub message: Option<String>,
}

/// Append-only consumer of sample events, shared by every virtual user.
///
/// `deliver` is called concurrently from many tasks and must not block for long.
pub trait ResultSink: Send + Sync {
    fn deliver(&self, event: SampleEvent);

    /// Called once by the engine after the last thread group has terminated.
    fn close(&self) {}
}

/// Forwards events into an unbounded channel; closing drops the sender.
#[derive(Debug)]
pub struct ChannelSink {
    tx: RwLock<Option<mpsc::UnboundedSender<SampleEvent>>>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SampleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx: RwLock::new(Some(tx)),
            dropped: AtomicU64::new(0),
        });
        (sink, rx)
    }

    /// Events delivered after close or after the receiver went away.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ResultSink for ChannelSink {
    fn deliver(&self, event: SampleEvent) {
        let sent = match self.tx.read().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        };
        if !sent {
            let prev = self.dropped.fetch_add(1, Ordering::Relaxed);
            if prev == 0 {
                log::warn!("result sink is closed; dropping sample events");
            }
        }
    }

    fn close(&self) {
        self.tx.write().take();
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SampleEvent>>,
    closes: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<SampleEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// How many times `close` has been called.
    #[must_use]
    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }
}

impl ResultSink for MemorySink {
    fn deliver(&self, event: SampleEvent) {
        self.events.lock().push(event);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(label: &str) -> SampleEvent {
        SampleEvent {
            group: Arc::from("g"),
            user: 1,
            iteration: 0,
            label: Arc::from(label),
            success: true,
            started_at: SystemTime::now(),
            elapsed: Duration::from_millis(1),
            payload: Value::Null,
            message: None,
        }
    }

    #[tokio::test]
    async fn channel_sink_ends_stream_on_close() {
        let (sink, mut rx) = ChannelSink::new();
        sink.deliver(event("a"));
        sink.close();
        sink.deliver(event("b"));

        let first = rx.recv().await;
        assert_eq!(first.map(|e| e.label), Some(Arc::from("a")));
        assert!(rx.recv().await.is_none());
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn memory_sink_counts_closes() {
        let sink = MemorySink::new();
        sink.deliver(event("a"));
        sink.close();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.close_count(), 1);
    }
}
