use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use surge_value::Value;

use super::{Outcome, UnitError, UnitKind, UnitOfWork};
use crate::context::VuContext;

/// Tracks which child a composite is currently running so `interrupt` can reach it.
#[derive(Default)]
struct ActiveChild(Mutex<Option<Arc<dyn UnitOfWork>>>);

impl ActiveChild {
    async fn run_all(&self, ctx: &mut VuContext, children: &[Arc<dyn UnitOfWork>]) -> bool {
        let mut success = true;
        for child in children {
            if ctx.should_stop_iteration() {
                return false;
            }
            *self.0.lock() = Some(child.clone());
            let outcome = ctx.execute(child.as_ref()).await;
            self.0.lock().take();
            success &= outcome.success;
        }
        success
    }

    fn interrupt(&self) -> bool {
        let active = self.0.lock().clone();
        active.is_some_and(|child| child.interrupt())
    }
}

fn composite_outcome(success: bool) -> Outcome {
    if success {
        Outcome::success()
    } else {
        Outcome::failure("child failed")
    }
}

/// Runs its children in order.
pub struct Sequence {
    label: String,
    children: Vec<Arc<dyn UnitOfWork>>,
    active: ActiveChild,
}

impl Sequence {
    pub fn new(label: impl Into<String>, children: Vec<Arc<dyn UnitOfWork>>) -> Self {
        Self {
            label: label.into(),
            children,
            active: ActiveChild::default(),
        }
    }
}

#[async_trait]
impl UnitOfWork for Sequence {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Controller
    }

    async fn execute(&self, ctx: &mut VuContext) -> Result<Outcome, UnitError> {
        let success = self.active.run_all(ctx, &self.children).await;
        Ok(composite_outcome(success))
    }

    fn interrupt(&self) -> bool {
        self.active.interrupt()
    }
}

/// Runs its children `count` times per iteration.
pub struct Loop {
    label: String,
    count: u64,
    children: Vec<Arc<dyn UnitOfWork>>,
    active: ActiveChild,
}

impl Loop {
    pub fn new(label: impl Into<String>, count: u64, children: Vec<Arc<dyn UnitOfWork>>) -> Self {
        Self {
            label: label.into(),
            count,
            children,
            active: ActiveChild::default(),
        }
    }
}

#[async_trait]
impl UnitOfWork for Loop {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Controller
    }

    async fn execute(&self, ctx: &mut VuContext) -> Result<Outcome, UnitError> {
        let mut success = true;
        for _ in 0..self.count {
            if ctx.should_stop_iteration() {
                success = false;
                break;
            }
            success &= self.active.run_all(ctx, &self.children).await;
        }
        Ok(composite_outcome(success))
    }

    fn interrupt(&self) -> bool {
        self.active.interrupt()
    }
}

/// Runs its children when a user variable is set (and optionally equal to a value).
pub struct If {
    label: String,
    var: String,
    equals: Option<Value>,
    children: Vec<Arc<dyn UnitOfWork>>,
    active: ActiveChild,
}

impl If {
    pub fn new(
        label: impl Into<String>,
        var: impl Into<String>,
        equals: Option<Value>,
        children: Vec<Arc<dyn UnitOfWork>>,
    ) -> Self {
        Self {
            label: label.into(),
            var: var.into(),
            equals,
            children,
            active: ActiveChild::default(),
        }
    }

    fn matches(&self, ctx: &VuContext) -> bool {
        match (ctx.var(&self.var), &self.equals) {
            (None, _) => false,
            (Some(v), None) => !v.is_null() && v.as_bool() != Some(false),
            (Some(v), Some(expected)) => v == expected || v.to_string() == expected.to_string(),
        }
    }
}

#[async_trait]
impl UnitOfWork for If {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Controller
    }

    async fn execute(&self, ctx: &mut VuContext) -> Result<Outcome, UnitError> {
        if !self.matches(ctx) {
            return Ok(Outcome::success());
        }
        let success = self.active.run_all(ctx, &self.children).await;
        Ok(composite_outcome(success))
    }

    fn interrupt(&self) -> bool {
        self.active.interrupt()
    }
}
