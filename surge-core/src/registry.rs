//! Name-to-constructor registry that turns a plan description into per-user unit trees.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use surge_value::Value;

use crate::error::{Error, Result};
use crate::schedule::parse_duration;
use crate::unit::{Dummy, If, Loop, Sequence, Think, UnitOfWork};

/// In-memory description of one node of a test plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanNode {
    pub kind: String,
    pub label: Option<String>,
    pub params: BTreeMap<String, Value>,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn child(mut self, child: PlanNode) -> Self {
        self.children.push(child);
        self
    }

    /// Label if set, otherwise the kind.
    #[must_use]
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.kind)
    }

    pub fn params(&self) -> Params<'_> {
        Params { node: self }
    }
}

/// Typed accessors over a node's parameters.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    node: &'a PlanNode,
}

impl Params<'_> {
    fn invalid(&self, param: &str, reason: impl Into<String>) -> Error {
        Error::param(self.node.display_label(), param, reason)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.node.params.get(name)
    }

    /// Accepts duration strings (`250ms`, `2s`) or a number of seconds.
    pub fn duration(&self, name: &str) -> Result<Option<Duration>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => parse_duration(s)
                .map(Some)
                .map_err(|e| self.invalid(name, e.to_string())),
            Some(v) => match v.as_f64() {
                Some(secs) => Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
                    self.invalid(name, format!("{secs} is not a valid number of seconds"))
                }),
                None => Err(self.invalid(
                    name,
                    format!("expected a duration, got {}", v.type_name()),
                )),
            },
        }
    }

    pub fn u64(&self, name: &str) -> Result<Option<u64>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(name, "expected a non-negative integer")),
        }
    }

    pub fn f64(&self, name: &str) -> Result<Option<f64>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(name, "expected a number")),
        }
    }

    pub fn bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| self.invalid(name, "expected a boolean")),
        }
    }

    pub fn str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| self.invalid(name, "expected a string")),
        }
    }

    pub fn required_str(&self, name: &str) -> Result<&str> {
        self.str(name)?
            .ok_or_else(|| self.invalid(name, "is required"))
    }
}

pub type Children = Vec<Arc<dyn UnitOfWork>>;

pub type Constructor =
    Arc<dyn Fn(&PlanNode, Children) -> Result<Arc<dyn UnitOfWork>> + Send + Sync>;

/// Maps unit kind names to constructors.
#[derive(Clone, Default)]
pub struct UnitRegistry {
    constructors: HashMap<String, Constructor>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `sequence`, `loop`, `if`, `dummy` and `think`.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("sequence", |node, children| {
            Ok(Arc::new(Sequence::new(node.display_label(), children)))
        });
        registry.register("loop", |node, children| {
            let count = node.params().u64("count")?.unwrap_or(1);
            Ok(Arc::new(Loop::new(node.display_label(), count, children)))
        });
        registry.register("if", |node, children| {
            let params = node.params();
            let var = params.required_str("var")?;
            let equals = params.get("equals").cloned();
            Ok(Arc::new(If::new(node.display_label(), var, equals, children)))
        });
        registry.register("dummy", |node, children| {
            if !children.is_empty() {
                return Err(Error::param(
                    node.display_label(),
                    "children",
                    "samplers take no children",
                ));
            }
            let params = node.params();
            let mut dummy = Dummy::new(node.display_label());
            if let Some(latency) = params.duration("latency")? {
                dummy = dummy.latency(latency);
            }
            if let Some(success) = params.bool("success")? {
                dummy = dummy.success(success);
            }
            if let Some(rate) = params.f64("error_rate")? {
                if !(0.0..=1.0).contains(&rate) {
                    return Err(Error::param(
                        node.display_label(),
                        "error_rate",
                        "must be within [0, 1]",
                    ));
                }
                dummy = dummy.error_rate(rate);
            }
            if let Some(payload) = params.get("payload") {
                dummy = dummy.payload(payload.clone());
            }
            if let Some(var) = params.str("store_as")? {
                dummy = dummy.store_as(var);
            }
            Ok(Arc::new(dummy))
        });
        registry.register("think", |node, _children| {
            let params = node.params();
            let delay = params.duration("delay")?.unwrap_or_default();
            let range = params.duration("range")?.unwrap_or_default();
            Ok(Arc::new(Think::new(node.display_label(), delay, range)))
        });
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&PlanNode, Children) -> Result<Arc<dyn UnitOfWork>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Instantiates `node` and its children, depth first.
    pub fn build(&self, node: &PlanNode) -> Result<Arc<dyn UnitOfWork>> {
        let Some(constructor) = self.constructors.get(&node.kind) else {
            return Err(Error::UnknownUnit(node.kind.clone()));
        };
        let children = node
            .children
            .iter()
            .map(|child| self.build(child))
            .collect::<Result<Vec<_>>>()?;
        constructor(node, children)
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.constructors.keys().collect();
        kinds.sort();
        f.debug_struct("UnitRegistry").field("kinds", &kinds).finish()
    }
}

/// Produces a fresh unit tree for every virtual user.
pub trait PlanFactory: Send + Sync {
    fn build(&self) -> Result<Arc<dyn UnitOfWork>>;
}

/// Plan described by a [`PlanNode`] tree and instantiated through a registry.
#[derive(Debug, Clone)]
pub struct RegistryPlan {
    registry: Arc<UnitRegistry>,
    root: PlanNode,
}

impl RegistryPlan {
    pub fn new(registry: Arc<UnitRegistry>, root: PlanNode) -> Self {
        Self { registry, root }
    }

    #[must_use]
    pub fn root(&self) -> &PlanNode {
        &self.root
    }
}

impl PlanFactory for RegistryPlan {
    fn build(&self) -> Result<Arc<dyn UnitOfWork>> {
        self.registry.build(&self.root)
    }
}

/// Plan backed by a closure.
pub struct FnPlan<F>(F);

impl<F> PlanFactory for FnPlan<F>
where
    F: Fn() -> Result<Arc<dyn UnitOfWork>> + Send + Sync,
{
    fn build(&self) -> Result<Arc<dyn UnitOfWork>> {
        (self.0)()
    }
}

pub fn plan_fn<F>(f: F) -> Arc<dyn PlanFactory>
where
    F: Fn() -> Result<Arc<dyn UnitOfWork>> + Send + Sync + 'static,
{
    Arc::new(FnPlan(f))
}
