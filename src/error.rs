use std::error::Error;
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug)]
pub enum AgentError {
    /// A movement action left the distance to the goal unchanged.
    ZeroMovement { instr_id: String, distance: f32 },
    /// The oracle viewpoint is neither a candidate nor the current viewpoint.
    TeacherMismatch {
        instr_id: String,
        teacher: String,
        viewpoint: String,
    },
    /// The simulator ended up somewhere other than the selected candidate.
    SimulatorMismatch {
        instr_id: String,
        expected: String,
        found: String,
    },
    UnexpectedEncoderResponse { expected: &'static str },
    UnknownScan(String),
    UnknownViewpoint { scan: String, viewpoint: String },
    InvalidConfig(String),
    Tensor(String),
    Checkpoint(String),
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for AgentError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AgentError::ZeroMovement { instr_id, distance } => write!(
                formatter,
                "action for {} did not change the distance to goal ({:.3})",
                instr_id, distance
            ),
            AgentError::TeacherMismatch {
                instr_id,
                teacher,
                viewpoint,
            } => write!(
                formatter,
                "teacher viewpoint {} for {} is neither a candidate nor the current viewpoint {}",
                teacher, instr_id, viewpoint
            ),
            AgentError::SimulatorMismatch {
                instr_id,
                expected,
                found,
            } => write!(
                formatter,
                "simulator for {} expected {}, found {}",
                instr_id, expected, found
            ),
            AgentError::UnexpectedEncoderResponse { expected } => {
                write!(formatter, "encoder did not return a {} response", expected)
            }
            AgentError::UnknownScan(scan) => write!(formatter, "unknown scan {}", scan),
            AgentError::UnknownViewpoint { scan, viewpoint } => {
                write!(formatter, "unknown viewpoint {} in scan {}", viewpoint, scan)
            }
            AgentError::InvalidConfig(message) => {
                write!(formatter, "invalid configuration: {}", message)
            }
            AgentError::Tensor(message) => write!(formatter, "tensor error: {}", message),
            AgentError::Checkpoint(message) => write!(formatter, "checkpoint error: {}", message),
            AgentError::Io(e) => write!(formatter, "IO error: {}", e),
            AgentError::Json(e) => write!(formatter, "JSON error: {}", e),
        }
    }
}

impl Error for AgentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AgentError::Io(e) => Some(e),
            AgentError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for AgentError {
    fn from(e: io::Error) -> Self {
        AgentError::Io(e)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Json(e)
    }
}
