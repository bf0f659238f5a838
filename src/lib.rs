// krusty-jobs: print job lifecycle on top of an abstract printer protocol

pub mod job;
pub mod simulator;
pub mod timer;

pub use job::device_file::DeviceFileJob;
pub use job::listener::{
    JobEvent, ListenerRegistry, ListenerResult, LoggingListener, PrintJobListener,
};
pub use job::local_file::{
    GcodeLines, LineProcessor, LocalFileJob, LocalGcodeFileJob, LocalGcodeStreamJob,
    LocalPlainFileJob, PlainLines, RawLines, TextEncoding,
};
pub use job::{ContentStream, JobCore, PrintJob, stream_lines};
pub use krusty_shared::{JobState, JobVariant, PrintJobError};
pub use simulator::SimulatedProtocol;
pub use timer::RepeatedTimer;
