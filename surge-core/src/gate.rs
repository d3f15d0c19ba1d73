use tokio::time::Instant;

/// Per-user iteration budget: an optional loop count and an optional shared deadline.
///
/// With neither set the user loops until it is stopped.
#[derive(Debug, Clone)]
pub struct IterationGate {
    started: u64,
    loops: Option<u64>,
    deadline: Option<Instant>,
}

impl IterationGate {
    pub fn new(loops: Option<u64>, deadline: Option<Instant>) -> Self {
        Self {
            started: 0,
            loops,
            deadline,
        }
    }

    /// Single-iteration gate used for arrival-driven users.
    pub fn once() -> Self {
        Self::new(Some(1), None)
    }

    /// Claims the next iteration; `false` once the budget is exhausted.
    pub fn next(&mut self, now: Instant) -> bool {
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            return false;
        }
        if self.loops.is_some_and(|total| self.started >= total) {
            return false;
        }
        self.started += 1;
        true
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn loop_budget() {
        let now = Instant::now();
        let mut gate = IterationGate::new(Some(2), None);
        assert!(gate.next(now));
        assert!(gate.next(now));
        assert!(!gate.next(now));
    }

    #[test]
    fn deadline_budget() {
        let now = Instant::now();
        let mut gate = IterationGate::new(None, Some(now + Duration::from_secs(1)));
        assert!(gate.next(now));
        assert!(gate.next(now + Duration::from_millis(999)));
        assert!(!gate.next(now + Duration::from_secs(1)));
    }

    #[test]
    fn unbounded_gate_keeps_going() {
        let now = Instant::now();
        let mut gate = IterationGate::new(None, None);
        assert!((0..1_000).all(|_| gate.next(now)));
    }
}
