//! In-process protocol that behaves like a printer with its own storage.
//!
//! Lines sent by local jobs are recorded. Device prints advance by a fixed
//! number of bytes on every status query and finish once the whole file has
//! been "printed".

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use krusty_shared::config::SimulatorConfig;
use krusty_shared::{
    DeviceFileInfo, FileAwareProtocol, FileAwareProtocolListener, JobVariant, Protocol,
    ProtocolError,
};

use crate::job::listener::ListenerRegistry;
use crate::job::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePrint {
    pub name: String,
    pub size: u64,
    pub position: u64,
}

#[derive(Debug)]
pub struct SimulatedProtocol {
    name: String,
    supported_jobs: HashSet<JobVariant>,
    streaming: bool,
    file_aware: bool,
    bytes_per_status: u64,
    files: Mutex<BTreeMap<String, u64>>,
    current: Mutex<Option<DevicePrint>>,
    sent: Mutex<Vec<String>>,
    status_queries: AtomicUsize,
    listeners: ListenerRegistry<dyn FileAwareProtocolListener>,
}

impl SimulatedProtocol {
    pub fn new(config: &SimulatorConfig) -> Self {
        tracing::info!(
            "Simulated protocol '{}': jobs {:?}, streaming {}, file aware {}",
            config.name,
            config.supported_jobs,
            config.streaming,
            config.file_aware
        );
        Self {
            name: config.name.clone(),
            supported_jobs: config.supported_jobs.clone(),
            streaming: config.streaming,
            file_aware: config.file_aware,
            bytes_per_status: config.bytes_per_status.max(1),
            files: Mutex::new(config.files.clone()),
            current: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            status_queries: AtomicUsize::new(0),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn add_file(&self, name: impl Into<String>, size: u64) {
        lock(&self.files).insert(name.into(), size);
    }

    pub fn files(&self) -> Vec<DeviceFileInfo> {
        lock(&self.files)
            .iter()
            .map(|(name, size)| DeviceFileInfo { name: name.clone(), size: *size })
            .collect()
    }

    /// Report the device's file list to every listener.
    pub fn list_files(&self) {
        let files = self.files();
        self.listeners.dispatch("on_protocol_file_list", |l| {
            l.on_protocol_file_list(&files);
            Ok(())
        });
    }

    /// Accept one line from a local job.
    pub fn send_line(&self, line: String) -> Result<(), ProtocolError> {
        tracing::debug!("-> {}", line.trim_end());
        lock(&self.sent).push(line);
        Ok(())
    }

    pub fn sent_lines(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Store everything sent so far as a device file and return its size.
    pub fn finish_upload(&self, name: impl Into<String>) -> Result<u64, ProtocolError> {
        if !self.streaming {
            return Err(ProtocolError::Unsupported("file streaming".to_string()));
        }
        let lines = std::mem::take(&mut *lock(&self.sent));
        let size = lines.iter().map(|line| line.len() as u64).sum();
        let name = name.into();
        tracing::info!("Stored {} ({} bytes) on device", name, size);
        self.add_file(name, size);
        Ok(size)
    }

    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn current_print(&self) -> Option<DevicePrint> {
        lock(&self.current).clone()
    }

    /// Abort the running device print, as if the device reported an error.
    pub fn fail_print(&self, reason: &str) {
        if lock(&self.current).take().is_none() {
            return;
        }
        self.listeners.dispatch("on_protocol_file_print_failed", |l| {
            l.on_protocol_file_print_failed(reason);
            Ok(())
        });
    }
}

impl Protocol for SimulatedProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_job(&self, variant: JobVariant) -> bool {
        self.supported_jobs.contains(&variant)
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn file_aware(&self) -> Option<&dyn FileAwareProtocol> {
        if self.file_aware { Some(self) } else { None }
    }
}

impl FileAwareProtocol for SimulatedProtocol {
    fn start_file_print(&self, name: &str, position: u64) -> Result<(), ProtocolError> {
        let size = lock(&self.files)
            .get(name)
            .copied()
            .ok_or_else(|| ProtocolError::FileNotFound(name.to_string()))?;
        if position > size {
            return Err(ProtocolError::Io(format!(
                "cannot start {} at byte {}, file has {} bytes",
                name, position, size
            )));
        }
        *lock(&self.current) = Some(DevicePrint {
            name: name.to_string(),
            size,
            position,
        });
        self.listeners.dispatch("on_protocol_file_print_started", |l| {
            l.on_protocol_file_print_started(name, size);
            Ok(())
        });
        Ok(())
    }

    fn get_file_print_status(&self) -> Result<(), ProtocolError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        let report = {
            let mut current = lock(&self.current);
            let Some(print) = current.as_mut() else {
                return Ok(());
            };
            print.position = (print.position + self.bytes_per_status).min(print.size);
            let report = (print.name.clone(), print.position, print.size);
            if print.position >= print.size {
                *current = None;
            }
            report
        };
        let (name, position, size) = report;
        self.listeners.dispatch("on_protocol_file_status", |l| {
            l.on_protocol_file_status(&name, position, size);
            Ok(())
        });
        if position >= size {
            self.listeners.dispatch("on_protocol_file_print_done", |l| {
                l.on_protocol_file_print_done();
                Ok(())
            });
        }
        Ok(())
    }

    fn register_listener(&self, listener: Arc<dyn FileAwareProtocolListener>) {
        self.listeners.register(listener);
    }

    fn unregister_listener(&self, listener: &Arc<dyn FileAwareProtocolListener>) -> bool {
        self.listeners.unregister(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl FileAwareProtocolListener for Recorder {
        fn on_protocol_file_list(&self, files: &[DeviceFileInfo]) {
            for file in files {
                lock(&self.events).push(format!("file {} {}", file.name, file.size));
            }
        }

        fn on_protocol_file_status(&self, name: &str, position: u64, total: u64) {
            lock(&self.events).push(format!("status {} {}/{}", name, position, total));
        }

        fn on_protocol_file_print_started(&self, name: &str, size: u64) {
            lock(&self.events).push(format!("started {} {}", name, size));
        }

        fn on_protocol_file_print_done(&self) {
            lock(&self.events).push("done".to_string());
        }
    }

    fn protocol_with_file(size: u64, step: u64) -> SimulatedProtocol {
        let mut config = SimulatorConfig::default();
        config.bytes_per_status = step;
        config.files.insert("job.gcode".to_string(), size);
        SimulatedProtocol::new(&config)
    }

    #[test]
    fn test_device_print_advances_until_done() {
        let protocol = protocol_with_file(1000, 400);
        let recorder = Arc::new(Recorder::default());
        protocol.register_listener(recorder.clone());

        protocol.start_file_print("job.gcode", 0).unwrap();
        for _ in 0..4 {
            protocol.get_file_print_status().unwrap();
        }

        assert_eq!(
            *lock(&recorder.events),
            vec![
                "started job.gcode 1000".to_string(),
                "status job.gcode 400/1000".to_string(),
                "status job.gcode 800/1000".to_string(),
                "status job.gcode 1000/1000".to_string(),
                "done".to_string(),
            ]
        );
        assert_eq!(protocol.status_queries(), 4);
        assert!(protocol.current_print().is_none());
    }

    #[test]
    fn test_list_files_reports_storage() {
        let protocol = protocol_with_file(1000, 1);
        protocol.add_file("a.gcode", 12);
        let recorder = Arc::new(Recorder::default());
        protocol.register_listener(recorder.clone());

        protocol.list_files();
        assert_eq!(
            *lock(&recorder.events),
            vec!["file a.gcode 12".to_string(), "file job.gcode 1000".to_string()]
        );
    }

    #[test]
    fn test_unknown_file_is_rejected() {
        let protocol = protocol_with_file(10, 1);
        assert_eq!(
            protocol.start_file_print("missing.gcode", 0),
            Err(ProtocolError::FileNotFound("missing.gcode".to_string()))
        );
    }

    #[test]
    fn test_finish_upload_stores_sent_bytes() {
        let protocol = protocol_with_file(10, 1);
        protocol.send_line("G28\n".to_string()).unwrap();
        protocol.send_line("G1 X1\n".to_string()).unwrap();
        assert_eq!(protocol.finish_upload("upload.gcode").unwrap(), 10);
        assert!(protocol.sent_lines().is_empty());
        let stored = DeviceFileInfo { name: "upload.gcode".to_string(), size: 10 };
        assert!(protocol.files().contains(&stored));
    }

    #[test]
    fn test_capabilities_follow_config() {
        let mut config = SimulatorConfig::default();
        config.file_aware = false;
        config.streaming = false;
        let protocol = SimulatedProtocol::new(&config);
        assert!(protocol.file_aware().is_none());
        assert!(!protocol.supports_streaming());
        assert!(protocol.supports_job(JobVariant::LocalGcodeFile));
    }
}
