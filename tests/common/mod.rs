// Shared fixtures for the job integration tests
#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use krusty_jobs::{
    JobEvent, ListenerResult, LocalFileJob, LocalPlainFileJob, PlainLines, PrintJob,
    PrintJobListener, SimulatedProtocol, TextEncoding,
};
use krusty_shared::config::SimulatorConfig;
use tempfile::TempDir;

/// Records every lifecycle event it receives, in order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: JobEvent) -> usize {
        self.events().iter().filter(|e| **e == event).count()
    }

    fn record(&self, event: JobEvent) -> ListenerResult {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl PrintJobListener for RecordingListener {
    fn on_job_started(&self, _job: &dyn PrintJob) -> ListenerResult {
        self.record(JobEvent::Started)
    }

    fn on_job_done(&self, _job: &dyn PrintJob) -> ListenerResult {
        self.record(JobEvent::Done)
    }

    fn on_job_cancelled(&self, _job: &dyn PrintJob) -> ListenerResult {
        self.record(JobEvent::Cancelled)
    }

    fn on_job_failed(&self, _job: &dyn PrintJob) -> ListenerResult {
        self.record(JobEvent::Failed)
    }
}

pub fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    path
}

pub async fn plain_job(path: &Path) -> LocalPlainFileJob {
    LocalFileJob::new(path, TextEncoding::Utf8, PlainLines).await.unwrap()
}

pub fn simulator(config: SimulatorConfig) -> Arc<SimulatedProtocol> {
    Arc::new(SimulatedProtocol::new(&config))
}

pub fn default_simulator() -> Arc<SimulatedProtocol> {
    simulator(SimulatorConfig::default())
}
