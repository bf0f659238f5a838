// krusty_shared: job and protocol types shared by the job runtime, protocols, and tests

pub mod config;
pub mod gcode_utils;
pub mod print_job;
pub mod protocol;

pub use print_job::{JobState, JobVariant, PrintJobError};
pub use protocol::{
    DeviceFileInfo, FileAwareProtocol, FileAwareProtocolListener, Protocol, ProtocolError,
};
