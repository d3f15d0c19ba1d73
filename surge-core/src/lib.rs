mod arrival;
mod config;
mod context;
mod engine;
mod error;
mod gate;
mod group;
mod pacing;
mod ramp;
mod registry;
mod schedule;
mod sink;
mod unit;
mod vu;

pub use arrival::{ArrivalDistribution, ArrivalProcess};
pub use config::{
    ClosedModel, ConcurrencyModel, DEFAULT_INTERRUPT_GRACE, DEFAULT_STOP_TIMEOUT, EngineConfig,
    ModelKind, OnSampleError, OpenModel, ThreadGroupConfig, ThreadGroupOptions,
};
pub use context::VuContext;
pub use engine::{Engine, EngineReport, Termination};
pub use error::{Error, Result};
pub use gate::IterationGate;
pub use group::{GroupReport, RunState, ThreadGroup};
pub use pacing::{
    Pacing, PacingEnv, PacingTimer, PreviousIteration, ThroughputMode, ThroughputSlot,
};
pub use ramp::RampUp;
pub use registry::{
    Children, Constructor, FnPlan, Params, PlanFactory, PlanNode, RegistryPlan, UnitRegistry,
    plan_fn,
};
pub use schedule::{
    ParseErrorKind, Phase, ScheduleParseError, ScheduleSpec, parse_duration, parse_schedule,
};
pub use sink::{ChannelSink, MemorySink, ResultSink, SampleEvent};
pub use unit::{Dummy, If, Loop, Outcome, Sequence, Think, UnitError, UnitKind, UnitOfWork};
pub use vu::{UserReport, UserState};
pub use surge_value::Value;
