use crate::transport::Tag;
use std::fmt;
use thiserror::Error;

/// maximum number of worker threads a single rank may run
/// each tag channel reserves this many consecutive tags
pub const MAX_CORES_PER_RANK: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("Invalid next step {next}, expected {expected}")]
    InvalidTransition { next: Step, expected: &'static str },
    #[error("Cannot move from step {0}")]
    TerminalStep(Step),
    #[error("Unexpected step {0}")]
    UnexpectedStep(Step),
    #[error("Too many cores per rank ({0} > {MAX_CORES_PER_RANK})")]
    TooManyCores(usize),
    #[error("Invalid length message {0}")]
    InvalidLength(i32),
}

/// cluster wide phase, all ranks agree on it before issuing step specific operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    CommonFilesBroadcast,
    TasksExecution,
    Shutdown,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CommonFilesBroadcast => "COMMON_FILES_BCAST",
            Self::TasksExecution => "TASKS_EXECUTION",
            Self::Shutdown => "SHUTDOWN",
        })
    }
}

/// How the coordinator has to tell the worker ranks about a step change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// already in the requested step
    Stay,
    /// broadcast the sentinel on the common file length channel
    Broadcast(i32),
    /// send the sentinel on every worker thread job length slot, then barrier
    DrainSlots(i32),
}

impl Step {
    /// validate a step change requested by the coordinator
    pub fn transition(self, next: Step) -> Result<Transition, StepError> {
        if self == next {
            return Ok(Transition::Stay);
        }

        match self {
            Self::CommonFilesBroadcast => match next {
                Self::TasksExecution | Self::Shutdown => {
                    Ok(Transition::Broadcast(next.sentinel()))
                }
                _ => Err(StepError::InvalidTransition {
                    next,
                    expected: "TASKS_EXECUTION|SHUTDOWN",
                }),
            },
            Self::TasksExecution => match next {
                Self::CommonFilesBroadcast | Self::Shutdown => {
                    Ok(Transition::DrainSlots(next.sentinel()))
                }
                _ => Err(StepError::InvalidTransition {
                    next,
                    expected: "COMMON_FILES_BCAST|SHUTDOWN",
                }),
            },
            Self::Shutdown => Err(StepError::TerminalStep(self)),
        }
    }

    /// reserved negative length announcing a switch to this step
    pub fn sentinel(self) -> i32 {
        match self {
            Self::CommonFilesBroadcast => -1,
            Self::TasksExecution => -2,
            Self::Shutdown => -3,
        }
    }

    pub fn from_sentinel(length: i32) -> Result<Self, StepError> {
        match length {
            -1 => Ok(Self::CommonFilesBroadcast),
            -2 => Ok(Self::TasksExecution),
            -3 => Ok(Self::Shutdown),
            other => Err(StepError::InvalidLength(other)),
        }
    }

    pub fn expect(self, expected: Step) -> Result<(), StepError> {
        if self == expected {
            Ok(())
        } else {
            Err(StepError::UnexpectedStep(self))
        }
    }
}

/// A length message is either a byte count or a step sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    Bytes(usize),
    Switch(Step),
}

impl Length {
    pub fn encode(length: usize) -> Result<[u8; 4], StepError> {
        i32::try_from(length)
            .map(i32::to_le_bytes)
            .map_err(|_| StepError::InvalidLength(i32::MAX))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StepError> {
        let raw: [u8; 4] = bytes
            .try_into()
            .map_err(|_| StepError::InvalidLength(bytes.len() as i32))?;
        let value = i32::from_le_bytes(raw);

        if value < 0 {
            Step::from_sentinel(value).map(Self::Switch)
        } else {
            Ok(Self::Bytes(value as usize))
        }
    }
}

/// the four logical channels, each one reserving a tag per worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    JobLength,
    JobBuffer,
    ResultLength,
    ResultBuffer,
}

impl Channel {
    pub fn tag(self, thread: usize) -> Tag {
        debug_assert!(thread < MAX_CORES_PER_RANK);

        let base = match self {
            Self::JobLength => 0,
            Self::JobBuffer => MAX_CORES_PER_RANK,
            Self::ResultLength => 2 * MAX_CORES_PER_RANK,
            Self::ResultBuffer => 3 * MAX_CORES_PER_RANK,
        };

        (base + thread) as Tag
    }
}

pub fn check_cores(cores: usize) -> Result<usize, StepError> {
    if cores > MAX_CORES_PER_RANK {
        Err(StepError::TooManyCores(cores))
    } else {
        Ok(cores)
    }
}
