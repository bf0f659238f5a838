use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum PrintJobError {
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("Protocol '{protocol}' cannot process {variant:?} jobs")]
    Unsupported { variant: Option<JobVariant>, protocol: String },
    #[error("Position {position} is beyond the end of the file ({size} bytes)")]
    InvalidPosition { position: u64, size: u64 },
    #[error("Unsupported text encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Lifecycle of a single job. `Done`, `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Processing,
    Done,
    Cancelled,
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled | JobState::Failed(_))
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, JobState::Processing)
    }
}

/// The job strategies a protocol can declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobVariant {
    /// Local file, lines handed over untouched.
    LocalFile,
    /// Local G-code file, comments stripped and offsets applied.
    LocalGcodeFile,
    /// Local file streamed verbatim onto the device's own storage.
    LocalGcodeStream,
    /// File already stored on the device and printed by it.
    DeviceFile,
}
