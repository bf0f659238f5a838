//! Print job state machine shared by every job variant.

pub mod device_file;
pub mod listener;
pub mod local_file;

use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use krusty_shared::{JobState, JobVariant, PrintJobError, Protocol, ProtocolError};

use listener::{JobEvent, ListenerRegistry, PrintJobListener, dispatch_job_event};

/// Lazily produced file content, independent of a job's live cursor.
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<String, PrintJobError>> + Send>>;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct CoreState {
    state: JobState,
    started: Option<Instant>,
    protocol: Option<Arc<dyn Protocol>>,
}

/// Bookkeeping every job carries: lifecycle state, start time, the protocol
/// currently driving it, and its listeners.
pub struct JobCore {
    id: Uuid,
    inner: Mutex<CoreState>,
    listeners: ListenerRegistry<dyn PrintJobListener>,
    state_tx: watch::Sender<JobState>,
}

impl Default for JobCore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl JobCore {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(JobState::Idle);
        Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(CoreState {
                state: JobState::Idle,
                started: None,
                protocol: None,
            }),
            listeners: ListenerRegistry::new(),
            state_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        lock(&self.inner).state.clone()
    }

    pub fn started_at(&self) -> Option<Instant> {
        lock(&self.inner).started
    }

    /// The protocol driving this job, only while it is processing.
    pub fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        lock(&self.inner).protocol.clone()
    }

    pub fn listeners(&self) -> &ListenerRegistry<dyn PrintJobListener> {
        &self.listeners
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    /// Idle -> Processing. Records the start time and binds the protocol.
    /// A job runs at most once; any other starting state is rejected.
    pub fn begin(&self, protocol: Arc<dyn Protocol>) -> Result<(), PrintJobError> {
        {
            let mut inner = lock(&self.inner);
            if inner.state != JobState::Idle {
                return Err(PrintJobError::InvalidTransition(format!(
                    "cannot process job {} in state {:?}",
                    self.id, inner.state
                )));
            }
            tracing::info!("Job {} processing on protocol '{}'", self.id, protocol.name());
            inner.state = JobState::Processing;
            inner.started = Some(Instant::now());
            inner.protocol = Some(protocol);
        }
        self.state_tx.send_replace(JobState::Processing);
        Ok(())
    }

    /// Processing -> `outcome`. Returns `false` without changing anything if
    /// the job is not processing, so only one caller ever wins the transition.
    pub fn finish(&self, outcome: JobState) -> bool {
        if !outcome.is_terminal() {
            tracing::warn!("Job {}: refusing non-terminal outcome {:?}", self.id, outcome);
            return false;
        }
        {
            let mut inner = lock(&self.inner);
            if inner.state != JobState::Processing {
                return false;
            }
            tracing::info!("Job {} -> {:?}", self.id, outcome);
            inner.state = outcome.clone();
            inner.protocol = None;
        }
        self.state_tx.send_replace(outcome);
        true
    }

    /// Move to `outcome` and, if this call made the transition, tell the
    /// listeners about it.
    pub fn conclude(&self, job: &dyn PrintJob, outcome: JobState) -> bool {
        let event = match outcome {
            JobState::Done => JobEvent::Done,
            JobState::Cancelled => JobEvent::Cancelled,
            JobState::Failed(_) => JobEvent::Failed,
            JobState::Idle | JobState::Processing => {
                tracing::warn!("Job {}: {:?} is not an outcome", self.id, outcome);
                return false;
            }
        };
        if !self.finish(outcome) {
            return false;
        }
        self.notify(event, job);
        true
    }

    /// Fan `event` out to every registered listener. Returns the number of
    /// listeners that failed.
    pub fn notify(&self, event: JobEvent, job: &dyn PrintJob) -> usize {
        dispatch_job_event(&self.listeners, event, job)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at().map(|started| Instant::now().saturating_duration_since(started))
    }

    /// Linear extrapolation of the total duration from the progress made so
    /// far. No smoothing. `None` while `lost_time` exceeds the elapsed time.
    pub fn time_estimate(&self, progress: Option<f64>, lost_time: Duration) -> Option<f64> {
        let elapsed = self.elapsed()?;
        let progress = progress.filter(|p| *p > 0.0)?;
        let spent = elapsed.checked_sub(lost_time)?;
        Some(spent.as_secs_f64() / progress)
    }

    pub async fn wait_finished(&self) -> JobState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }
}

#[async_trait]
pub trait PrintJob: Send + Sync {
    fn core(&self) -> &JobCore;

    fn variant(&self) -> Option<JobVariant> {
        None
    }

    /// Whether `protocol` declares the capabilities this job needs.
    fn can_process(&self, _protocol: &dyn Protocol) -> bool {
        false
    }

    /// Start the job. `position` is the byte offset to resume from.
    async fn process(
        &self,
        protocol: Arc<dyn Protocol>,
        position: u64,
    ) -> Result<(), PrintJobError>;

    /// Stop a processing job and release what it owns. Safe to call at any
    /// time, including after the job finished.
    async fn cancel(&self) {}

    /// Mark a processing job as failed, e.g. after the caller could not send
    /// one of its lines.
    async fn fail(&self, reason: &str);

    /// Next unit of content, or `None` once there is nothing to hand out.
    async fn get_next(&self) -> Result<Option<String>, PrintJobError> {
        Ok(None)
    }

    /// Fraction in `[0, 1]`, or `None` while it cannot be computed.
    fn progress(&self) -> Option<f64> {
        None
    }

    /// Estimated total duration in seconds.
    fn time_estimate(&self, lost_time: Duration) -> Option<f64> {
        self.core().time_estimate(self.progress(), lost_time)
    }

    fn can_get_content(&self) -> bool {
        false
    }

    fn content_stream(&self) -> Option<ContentStream> {
        None
    }

    fn state(&self) -> JobState {
        self.core().state()
    }

    fn register_listener(&self, listener: Arc<dyn PrintJobListener>) {
        self.core().listeners().register(listener);
    }

    fn unregister_listener(&self, listener: &Arc<dyn PrintJobListener>) -> bool {
        self.core().listeners().unregister(listener)
    }

    async fn wait_finished(&self) -> JobState {
        self.core().wait_finished().await
    }
}

pub(crate) fn ensure_can_process(
    job: &dyn PrintJob,
    protocol: &dyn Protocol,
) -> Result<(), PrintJobError> {
    if job.can_process(protocol) {
        Ok(())
    } else {
        Err(PrintJobError::Unsupported {
            variant: job.variant(),
            protocol: protocol.name().to_string(),
        })
    }
}

/// Pull lines from `job` and hand each one to `send` until the job runs dry.
/// A read or send error fails the job and is returned. Returns the number
/// of lines sent.
pub async fn stream_lines<F>(job: &dyn PrintJob, mut send: F) -> Result<u64, PrintJobError>
where
    F: FnMut(String) -> Result<(), ProtocolError>,
{
    let mut sent = 0;
    loop {
        let line = match job.get_next().await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(sent),
            Err(e) => {
                job.fail(&e.to_string()).await;
                return Err(e);
            }
        };
        if let Err(e) = send(line) {
            tracing::error!("Failed to send line {} of job {}: {}", sent + 1, job.core().id(), e);
            job.fail(&e.to_string()).await;
            return Err(e.into());
        }
        sent += 1;
    }
}
