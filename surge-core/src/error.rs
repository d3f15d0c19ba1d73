use crate::schedule::ScheduleParseError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleParseError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("thread group `{group}`: `users` must be a positive integer")]
    InvalidUsers { group: String },

    #[error("thread group `{group}`: `loops` must be a positive integer")]
    InvalidLoops { group: String },

    #[error("thread group `{group}`: `duration` must be a positive duration")]
    InvalidDuration { group: String },

    #[error("thread group `{group}`: open model needs a non-empty schedule")]
    EmptySchedule { group: String },

    #[error("thread group `{group}`: open model needs a `schedule`")]
    MissingSchedule { group: String },

    #[error("invalid pacing `{input}`: {reason}")]
    InvalidPacing { input: String, reason: String },

    #[error("invalid `{param}` for `{unit}`: {reason}")]
    InvalidParam {
        unit: String,
        param: String,
        reason: String,
    },

    #[error("unknown unit of work kind `{0}`")]
    UnknownUnit(String),

    #[error("invalid {kind} `{input}`")]
    InvalidName { kind: &'static str, input: String },

    #[error("test plan error: {0}")]
    Plan(String),

    #[error("engine has no thread groups")]
    NoGroups,

    #[error("engine was already started")]
    AlreadyStarted,

    #[error("thread group `{0}` is already running")]
    GroupRunning(String),
}

impl Error {
    pub(crate) fn param(unit: &str, param: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            unit: unit.to_string(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }
}
