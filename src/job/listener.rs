//! Listener registration and fault-isolated event fan-out.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use super::{PrintJob, lock};

pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type ListenerResult = Result<(), ListenerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Started,
    Done,
    Cancelled,
    Failed,
}

impl JobEvent {
    pub fn handler_name(&self) -> &'static str {
        match self {
            JobEvent::Started => "on_job_started",
            JobEvent::Done => "on_job_done",
            JobEvent::Cancelled => "on_job_cancelled",
            JobEvent::Failed => "on_job_failed",
        }
    }

    fn deliver(&self, listener: &dyn PrintJobListener, job: &dyn PrintJob) -> ListenerResult {
        match self {
            JobEvent::Started => listener.on_job_started(job),
            JobEvent::Done => listener.on_job_done(job),
            JobEvent::Cancelled => listener.on_job_cancelled(job),
            JobEvent::Failed => listener.on_job_failed(job),
        }
    }
}

/// Observer of job lifecycle events. Every handler defaults to a no-op, so
/// implementors only override the events they care about.
pub trait PrintJobListener: Send + Sync {
    fn on_job_started(&self, _job: &dyn PrintJob) -> ListenerResult {
        Ok(())
    }

    fn on_job_done(&self, _job: &dyn PrintJob) -> ListenerResult {
        Ok(())
    }

    fn on_job_cancelled(&self, _job: &dyn PrintJob) -> ListenerResult {
        Ok(())
    }

    fn on_job_failed(&self, _job: &dyn PrintJob) -> ListenerResult {
        Ok(())
    }
}

/// Ordered set of listeners. Insertion order is dispatch order.
///
/// Listeners are compared by identity, not by value. The registry never
/// holds its lock while a listener runs, so handlers may register or
/// unregister listeners (themselves included) during dispatch.
pub struct ListenerRegistry<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self { listeners: Mutex::new(Vec::new()) }
    }
}

impl<L: ?Sized> fmt::Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry").field("len", &self.len()).finish()
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<L>) {
        lock(&self.listeners).push(listener);
    }

    /// Remove the first registration of `listener`. Removing a listener that
    /// is not registered does nothing and returns `false`.
    pub fn unregister(&self, listener: &Arc<L>) -> bool {
        let mut listeners = lock(&self.listeners);
        match listeners.iter().position(|l| same_listener(l, listener)) {
            Some(idx) => {
                listeners.remove(idx);
                true
            }
            None => {
                tracing::debug!("Ignoring removal of a listener that is not registered");
                false
            }
        }
    }

    pub fn contains(&self, listener: &Arc<L>) -> bool {
        lock(&self.listeners).iter().any(|l| same_listener(l, listener))
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `deliver` on every listener in registration order and return how
    /// many of them failed. A failing or panicking listener is logged and
    /// skipped; the remaining listeners are still called.
    pub fn dispatch<F>(&self, event: &str, mut deliver: F) -> usize
    where
        F: FnMut(&L) -> ListenerResult,
    {
        let snapshot: Vec<Arc<L>> = lock(&self.listeners).clone();
        let mut failures = 0;
        for (index, listener) in snapshot.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!("Error while calling {} on listener #{}: {}", event, index, e);
                }
                Err(payload) => {
                    failures += 1;
                    tracing::error!(
                        "Listener #{} panicked in {}: {}",
                        index,
                        event,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        failures
    }
}

fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    // Compare data pointers only; vtable pointers of the same object can differ.
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}

pub(crate) fn dispatch_job_event(
    registry: &ListenerRegistry<dyn PrintJobListener>,
    event: JobEvent,
    job: &dyn PrintJob,
) -> usize {
    registry.dispatch(event.handler_name(), |listener| event.deliver(listener, job))
}

/// Logs every lifecycle event of the jobs it is registered on.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl PrintJobListener for LoggingListener {
    fn on_job_started(&self, job: &dyn PrintJob) -> ListenerResult {
        tracing::info!("Job {} started ({:?})", job.core().id(), job.variant());
        Ok(())
    }

    fn on_job_done(&self, job: &dyn PrintJob) -> ListenerResult {
        tracing::info!("Job {} done", job.core().id());
        Ok(())
    }

    fn on_job_cancelled(&self, job: &dyn PrintJob) -> ListenerResult {
        tracing::info!("Job {} cancelled", job.core().id());
        Ok(())
    }

    fn on_job_failed(&self, job: &dyn PrintJob) -> ListenerResult {
        tracing::warn!("Job {} failed: {:?}", job.core().id(), job.state());
        Ok(())
    }
}
