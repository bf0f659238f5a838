mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use krusty_jobs::{
    DeviceFileJob, JobEvent, JobState, ListenerResult, PrintJob, PrintJobError, PrintJobListener,
    SimulatedProtocol,
};
use krusty_shared::config::SimulatorConfig;
use krusty_shared::{FileAwareProtocolListener, JobVariant, ProtocolError};

use common::{RecordingListener, simulator};

fn device_with(name: &str, size: u64, bytes_per_status: u64) -> Arc<SimulatedProtocol> {
    let mut config = SimulatorConfig::default();
    config.bytes_per_status = bytes_per_status;
    config.files.insert(name.to_string(), size);
    simulator(config)
}

/// Cancels the job from inside its started notification.
struct CancelOnStart;

impl PrintJobListener for CancelOnStart {
    fn on_job_started(&self, job: &dyn PrintJob) -> ListenerResult {
        // the device job's cancel never suspends
        job.cancel().now_or_never().ok_or("cancel did not complete")?;
        Ok(())
    }
}

#[tokio::test]
async fn test_matching_status_updates_progress() {
    let protocol = device_with("job.gcode", 1000, 100);
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(3600));

    assert_eq!(job.progress(), None);
    job.process(protocol, 0).await.unwrap();
    assert_eq!(job.size(), Some(1000));
    assert_eq!(job.last_position(), Some(0));
    assert_eq!(job.progress(), Some(0.0));

    job.on_protocol_file_status("job.gcode", 250, 1000);
    assert_eq!(job.last_position(), Some(250));
    assert_eq!(job.progress(), Some(0.25));
    job.cancel().await;
}

#[tokio::test]
async fn test_status_for_other_file_is_ignored() {
    let protocol = device_with("job.gcode", 1000, 100);
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(3600));
    job.process(protocol, 120).await.unwrap();

    job.on_protocol_file_status("other.gcode", 900, 1000);
    job.on_protocol_file_print_started("other.gcode", 5);
    assert_eq!(job.last_position(), Some(120));
    assert_eq!(job.size(), Some(1000));
    assert_eq!(job.progress(), Some(0.12));
    job.cancel().await;
}

#[tokio::test]
async fn test_progress_unknown_until_size_arrives() {
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(3600));
    job.on_protocol_file_status("job.gcode", 10, 0);
    assert_eq!(job.progress(), None);
    job.on_protocol_file_status("job.gcode", 10, 40);
    assert_eq!(job.size(), Some(40));
    assert_eq!(job.progress(), Some(0.25));
}

#[tokio::test]
async fn test_print_done_finishes_once_and_unregisters() {
    let protocol = device_with("job.gcode", 1000, 100);
    let listener = Arc::new(RecordingListener::default());
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(3600));
    job.register_listener(listener.clone());

    job.process(protocol.clone(), 0).await.unwrap();
    assert!(job.is_active());
    assert_eq!(protocol.listener_count(), 1);

    job.on_protocol_file_print_done();
    job.on_protocol_file_print_done();

    assert!(!job.is_active());
    assert!(!job.is_polling());
    assert_eq!(protocol.listener_count(), 0);
    assert_eq!(job.state(), JobState::Done);
    assert_eq!(listener.events(), vec![JobEvent::Started, JobEvent::Done]);
}

#[tokio::test(start_paused = true)]
async fn test_polling_runs_print_to_completion() {
    let protocol = device_with("job.gcode", 1000, 400);
    let listener = Arc::new(RecordingListener::default());
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(2));
    job.register_listener(listener.clone());

    job.process(protocol.clone(), 0).await.unwrap();
    assert!(job.is_polling());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(protocol.status_queries(), 1);
    assert_eq!(job.progress(), Some(0.4));

    let state = job.wait_finished().await;
    assert_eq!(state, JobState::Done);
    assert_eq!(protocol.status_queries(), 3);
    assert_eq!(job.progress(), Some(1.0));
    assert_eq!(listener.count(JobEvent::Done), 1);
    assert_eq!(protocol.listener_count(), 0);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(protocol.status_queries(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_status_queries() {
    let protocol = device_with("job.gcode", 1_000_000, 1);
    let listener = Arc::new(RecordingListener::default());
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(1));
    job.register_listener(listener.clone());

    job.process(protocol.clone(), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(protocol.status_queries(), 3);

    job.cancel().await;
    let queries = protocol.status_queries();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(protocol.status_queries(), queries);

    assert!(!job.is_active());
    assert!(!job.is_polling());
    assert_eq!(protocol.listener_count(), 0);
    assert_eq!(job.state(), JobState::Cancelled);

    job.cancel().await;
    assert_eq!(listener.events(), vec![JobEvent::Started, JobEvent::Cancelled]);
}

#[tokio::test]
async fn test_cancel_before_process_is_noop() {
    let protocol = device_with("job.gcode", 1000, 100);
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(3600));

    job.cancel().await;
    assert_eq!(job.state(), JobState::Idle);
    job.process(protocol, 0).await.unwrap();
    assert_eq!(job.state(), JobState::Processing);
    job.cancel().await;
}

#[tokio::test]
async fn test_unknown_device_file_fails_job() {
    let protocol = device_with("job.gcode", 1000, 100);
    let listener = Arc::new(RecordingListener::default());
    let job = DeviceFileJob::new("missing.gcode", Duration::from_secs(1));
    job.register_listener(listener.clone());

    let err = job.process(protocol.clone(), 0).await.unwrap_err();
    assert!(matches!(
        err,
        PrintJobError::Protocol(ProtocolError::FileNotFound(ref name)) if name == "missing.gcode"
    ));
    assert!(matches!(job.state(), JobState::Failed(_)));
    assert!(!job.is_active());
    assert_eq!(protocol.listener_count(), 0);
    assert_eq!(listener.events(), vec![JobEvent::Started, JobEvent::Failed]);
}

#[tokio::test]
async fn test_device_reported_failure() {
    let protocol = device_with("job.gcode", 1000, 100);
    let listener = Arc::new(RecordingListener::default());
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(3600));
    job.register_listener(listener.clone());

    job.process(protocol.clone(), 0).await.unwrap();
    protocol.fail_print("thermal runaway");

    assert_eq!(job.state(), JobState::Failed("thermal runaway".to_string()));
    assert!(!job.is_active());
    assert_eq!(protocol.listener_count(), 0);
    assert_eq!(listener.events(), vec![JobEvent::Started, JobEvent::Failed]);
}

#[tokio::test]
async fn test_capabilities_required() {
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(1));

    let mut config = SimulatorConfig::default();
    config.file_aware = false;
    let not_file_aware = simulator(config);
    assert!(!job.can_process(not_file_aware.as_ref()));

    let mut config = SimulatorConfig::default();
    config.supported_jobs.remove(&JobVariant::DeviceFile);
    let not_declared = simulator(config);
    assert!(!job.can_process(not_declared.as_ref()));

    let err = job.process(not_declared, 0).await.unwrap_err();
    assert!(matches!(
        err,
        PrintJobError::Unsupported { variant: Some(JobVariant::DeviceFile), .. }
    ));
    assert_eq!(job.state(), JobState::Idle);

    assert!(job.can_process(simulator(SimulatorConfig::default()).as_ref()));
}

#[tokio::test]
async fn test_get_next_has_no_content() {
    let protocol = device_with("job.gcode", 1000, 100);
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(3600));
    job.process(protocol, 0).await.unwrap();

    assert!(job.get_next().await.unwrap().is_none());
    assert!(!job.can_get_content());
    assert!(job.content_stream().is_none());
    job.cancel().await;
}

#[tokio::test(start_paused = true)]
async fn test_device_time_estimate() {
    let protocol = device_with("job.gcode", 1000, 250);
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(5));
    job.process(protocol, 0).await.unwrap();
    assert_eq!(job.time_estimate(Duration::ZERO), None);

    tokio::time::sleep(Duration::from_millis(5500)).await;
    assert_eq!(job.progress(), Some(0.25));
    let estimate = job.time_estimate(Duration::ZERO).unwrap();
    assert!((estimate - 5.5 / 0.25).abs() < 1e-6);
    job.cancel().await;
}

#[tokio::test]
async fn test_cancel_during_start_keeps_device_idle() {
    let protocol = device_with("job.gcode", 1000, 100);
    let listener = Arc::new(RecordingListener::default());
    let job = DeviceFileJob::new("job.gcode", Duration::from_secs(1));
    job.register_listener(listener.clone());
    job.register_listener(Arc::new(CancelOnStart));

    job.process(protocol.clone(), 0).await.unwrap();

    assert_eq!(job.state(), JobState::Cancelled);
    assert!(protocol.current_print().is_none());
    assert!(!job.is_active());
    assert!(!job.is_polling());
    assert_eq!(protocol.listener_count(), 0);
    assert_eq!(listener.events(), vec![JobEvent::Started, JobEvent::Cancelled]);
}
