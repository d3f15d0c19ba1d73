#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// One or more samples failed.
    SamplesFailed = 10,

    /// Invalid CLI/config (bad flags, durations, schedules, pacing, etc.).
    InvalidInput = 30,

    /// The run itself failed (a thread group could not keep spawning users, a task died).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_samples(failed: u64) -> Self {
        if failed > 0 {
            Self::SamplesFailed
        } else {
            Self::Success
        }
    }
}
