//! Interfaces a communication channel exposes to print jobs.
//!
//! Capabilities are explicit: a protocol lists the job variants it can run,
//! reports whether it can stream raw file content onto the device, and hands
//! out its file-aware operations only if it has them.

use std::sync::Arc;
use thiserror::Error;

use crate::print_job::JobVariant;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Protocol is not connected")]
    NotConnected,
    #[error("File not found on device: {0}")]
    FileNotFound(String),
    #[error("Operation not supported: {0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(String),
}

pub trait Protocol: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this protocol declares support for the given job variant.
    fn supports_job(&self, variant: JobVariant) -> bool;

    /// Raw file content can be streamed onto the device's storage.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Device-resident file operations, if the protocol has them.
    fn file_aware(&self) -> Option<&dyn FileAwareProtocol> {
        None
    }
}

pub trait FileAwareProtocol: Send + Sync {
    /// Tell the device to start printing one of its own files from `position`.
    fn start_file_print(&self, name: &str, position: u64) -> Result<(), ProtocolError>;

    /// Ask the device for its print status. The answer arrives through
    /// [`FileAwareProtocolListener::on_protocol_file_status`].
    fn get_file_print_status(&self) -> Result<(), ProtocolError>;

    fn register_listener(&self, listener: Arc<dyn FileAwareProtocolListener>);

    /// Returns `false` if the listener was not registered.
    fn unregister_listener(&self, listener: &Arc<dyn FileAwareProtocolListener>) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFileInfo {
    pub name: String,
    pub size: u64,
}

/// Callbacks raised by a file-aware protocol. The protocol runs at most one
/// device print at a time, so the done and failed callbacks carry no name.
pub trait FileAwareProtocolListener: Send + Sync {
    fn on_protocol_file_list(&self, _files: &[DeviceFileInfo]) {}

    fn on_protocol_file_status(&self, _name: &str, _position: u64, _total: u64) {}

    fn on_protocol_file_print_started(&self, _name: &str, _size: u64) {}

    fn on_protocol_file_print_done(&self) {}

    fn on_protocol_file_print_failed(&self, _reason: &str) {}
}
