//! Job for a file already stored on the device. The device does the
//! printing; the job starts it, polls for status and follows the protocol's
//! callbacks.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use krusty_shared::{FileAwareProtocolListener, JobState, JobVariant, PrintJobError, Protocol};

use super::listener::JobEvent;
use super::{JobCore, PrintJob, ensure_can_process, lock};
use crate::timer::RepeatedTimer;

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, Copy)]
struct DeviceStatus {
    size: Option<u64>,
    last_position: Option<u64>,
}

pub struct DeviceFileJob {
    core: JobCore,
    filename: String,
    status_interval: Duration,
    this: Weak<DeviceFileJob>,
    active: AtomicBool,
    // size and position are read together for progress, so they share a lock
    status: Mutex<DeviceStatus>,
    timer: Mutex<Option<RepeatedTimer>>,
    registered_on: Mutex<Option<Arc<dyn Protocol>>>,
    // held by a tick around "still active? then query", and by cancel while
    // clearing `active`
    tick_gate: Mutex<()>,
}

impl std::fmt::Debug for DeviceFileJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFileJob")
            .field("core", &self.core)
            .field("filename", &self.filename)
            .field("status_interval", &self.status_interval)
            .field("active", &self.is_active())
            .field("status", &*lock(&self.status))
            .finish()
    }
}

impl DeviceFileJob {
    pub fn new(filename: impl Into<String>, status_interval: Duration) -> Arc<Self> {
        let filename = filename.into();
        Arc::new_cyclic(|this| Self {
            core: JobCore::new(),
            filename,
            status_interval,
            this: this.clone(),
            active: AtomicBool::new(false),
            status: Mutex::new(DeviceStatus::default()),
            timer: Mutex::new(None),
            registered_on: Mutex::new(None),
            tick_gate: Mutex::new(()),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn status_interval(&self) -> Duration {
        self.status_interval
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> Option<u64> {
        lock(&self.status).size
    }

    pub fn last_position(&self) -> Option<u64> {
        lock(&self.status).last_position
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.timer).as_ref().is_some_and(|timer| !timer.is_finished())
    }

    fn listener_handle(&self) -> Option<Arc<dyn FileAwareProtocolListener>> {
        self.this
            .upgrade()
            .map(|job| job as Arc<dyn FileAwareProtocolListener>)
    }

    fn start_status_timer(&self, protocol: Arc<dyn Protocol>) {
        let mut slot = lock(&self.timer);
        if !self.is_active() {
            return;
        }
        let condition_job = self.this.clone();
        let tick_job = self.this.clone();
        *slot = Some(RepeatedTimer::start(
            self.status_interval,
            move || condition_job.upgrade().is_some_and(|job| job.is_active()),
            move || {
                if let Some(job) = tick_job.upgrade() {
                    job.query_status(protocol.as_ref());
                }
            },
        ));
    }

    fn query_status(&self, protocol: &dyn Protocol) {
        let _gate = lock(&self.tick_gate);
        if !self.is_active() {
            return;
        }
        let Some(files) = protocol.file_aware() else {
            return;
        };
        tracing::debug!("Querying print status of {}", self.filename);
        if let Err(e) = files.get_file_print_status() {
            tracing::warn!("Status query for {} failed: {}", self.filename, e);
        }
    }

    /// Clear `active` so that no status query starts after this returns.
    fn deactivate(&self) {
        if self.is_active() {
            let _gate = lock(&self.tick_gate);
            self.active.store(false, Ordering::SeqCst);
        }
    }

    /// Stop polling and leave the protocol. Each resource is released once no
    /// matter how often this runs.
    fn release(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
        let protocol = lock(&self.registered_on).take();
        if let Some(protocol) = protocol {
            if let (Some(files), Some(me)) = (protocol.file_aware(), self.listener_handle()) {
                files.unregister_listener(&me);
                tracing::debug!("Job {} left protocol '{}'", self.core.id(), protocol.name());
            }
        }
    }
}

#[async_trait]
impl PrintJob for DeviceFileJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn variant(&self) -> Option<JobVariant> {
        Some(JobVariant::DeviceFile)
    }

    fn can_process(&self, protocol: &dyn Protocol) -> bool {
        protocol.supports_job(JobVariant::DeviceFile) && protocol.file_aware().is_some()
    }

    async fn process(
        &self,
        protocol: Arc<dyn Protocol>,
        position: u64,
    ) -> Result<(), PrintJobError> {
        ensure_can_process(self, protocol.as_ref())?;
        let listener = self.listener_handle().ok_or_else(|| {
            PrintJobError::InvalidTransition("device job is being dropped".to_string())
        })?;
        self.core.begin(protocol.clone())?;
        self.core.notify(JobEvent::Started, self);

        let Some(files) = protocol.file_aware() else {
            self.core.conclude(self, JobState::Failed("protocol lost file support".to_string()));
            return Err(PrintJobError::Unsupported {
                variant: self.variant(),
                protocol: protocol.name().to_string(),
            });
        };
        files.register_listener(listener);
        *lock(&self.registered_on) = Some(protocol.clone());
        lock(&self.status).last_position = Some(position);

        let started = {
            // `active` goes up before the state check: a concurrent cancel either
            // fails the check or waits on the gate until the start is issued
            let _gate = lock(&self.tick_gate);
            self.active.store(true, Ordering::SeqCst);
            if !self.core.state().is_processing() {
                self.active.store(false, Ordering::SeqCst);
                None
            } else {
                tracing::info!("Starting device print of {} at byte {}", self.filename, position);
                Some(files.start_file_print(&self.filename, position))
            }
        };
        match started {
            None => {
                tracing::debug!("Job {} stopped before the device print started", self.core.id());
                self.release();
                return Ok(());
            }
            Some(Err(e)) => {
                tracing::error!("Device refused to print {}: {}", self.filename, e);
                self.release();
                self.core.conclude(self, JobState::Failed(e.to_string()));
                return Err(e.into());
            }
            Some(Ok(())) => {}
        }

        self.start_status_timer(protocol);
        // cancelled or finished while starting up
        if !self.core.state().is_processing() {
            self.release();
        }
        Ok(())
    }

    async fn cancel(&self) {
        let cancelled = self.core.finish(JobState::Cancelled);
        self.deactivate();
        self.release();
        if cancelled {
            self.core.notify(JobEvent::Cancelled, self);
        }
    }

    async fn fail(&self, reason: &str) {
        let failed = self.core.finish(JobState::Failed(reason.to_string()));
        self.deactivate();
        self.release();
        if failed {
            self.core.notify(JobEvent::Failed, self);
        }
    }

    fn progress(&self) -> Option<f64> {
        let status = *lock(&self.status);
        match (status.last_position, status.size) {
            (Some(position), Some(size)) if size > 0 => {
                Some((position as f64 / size as f64).clamp(0.0, 1.0))
            }
            _ => None,
        }
    }
}

impl FileAwareProtocolListener for DeviceFileJob {
    fn on_protocol_file_print_started(&self, name: &str, size: u64) {
        if name != self.filename {
            return;
        }
        tracing::debug!("Device started {} ({} bytes)", name, size);
        lock(&self.status).size = Some(size);
    }

    fn on_protocol_file_status(&self, name: &str, position: u64, total: u64) {
        if name != self.filename {
            return;
        }
        let mut status = lock(&self.status);
        status.last_position = Some(position);
        if status.size.is_none() && total > 0 {
            status.size = Some(total);
        }
    }

    fn on_protocol_file_print_done(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.release();
        self.core.conclude(self, JobState::Done);
    }

    fn on_protocol_file_print_failed(&self, reason: &str) {
        tracing::warn!("Device reported failure printing {}: {}", self.filename, reason);
        self.release();
        self.core.conclude(self, JobState::Failed(reason.to_string()));
    }
}
