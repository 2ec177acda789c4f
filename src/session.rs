//! Session orchestrator: discovery, phase sequencing, callback delivery,
//! and cooperative cancellation.

use crate::client::{
    DownloadClient, PhaseConfig, PhaseEvent, PhaseResult, StopHandle, UploadClient,
};
use crate::driver::{run_phase, PhaseOutcome};
use crate::error::ClientError;
use crate::locator::{ConnectionMode, LocatorClient, TestServer, DEFAULT_LOCATOR_URL};
use crate::measurement::{Direction, MeasurementProgress, SpeedTestMeasurement};
use crate::timeouts::MEASUREMENT_DURATION_DEFAULT;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Which phases one `start` call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestType {
    Download,
    Upload,
    DownloadThenUpload,
}

impl TestType {
    fn wants_download(self) -> bool {
        matches!(self, TestType::Download | TestType::DownloadThenUpload)
    }

    fn wants_upload(self) -> bool {
        matches!(self, TestType::Upload | TestType::DownloadThenUpload)
    }
}

/// Receiver side of the session's user-visible callbacks.
///
/// All methods have no-op defaults; implement the ones you care about.
/// Delivery is in order on a dedicated task, never on the I/O path, and
/// nothing is delivered after a phase has finished.
pub trait SessionSink: Send + Sync + 'static {
    fn on_server_selected(&self, _server: &TestServer) {}
    fn on_download_progress(&self, _progress: MeasurementProgress) {}
    fn on_download_measurement(&self, _measurement: SpeedTestMeasurement) {}
    fn on_upload_progress(&self, _progress: MeasurementProgress) {}
    fn on_upload_measurement(&self, _measurement: SpeedTestMeasurement) {}
}

/// Sink for callers that only want the final report.
pub struct NullSink;

impl SessionSink for NullSink {}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connection_mode: ConnectionMode,
    pub duration: Duration,
    pub device_name: Option<String>,
    pub locator_url: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::Secure,
            duration: MEASUREMENT_DURATION_DEFAULT,
            device_name: None,
            locator_url: DEFAULT_LOCATOR_URL.to_string(),
        }
    }
}

impl SessionOptions {
    pub fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration.max(Duration::from_millis(1));
        self
    }

    pub fn device_name(mut self, device_name: impl Into<String>) -> Self {
        self.device_name = Some(device_name.into());
        self
    }

    pub fn locator_url(mut self, url: impl Into<String>) -> Self {
        self.locator_url = url.into();
        self
    }
}

/// Final report of one `start` call.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// The locator's first-ranked server, as announced via
    /// `on_server_selected`. The per-phase outcomes name the server that
    /// actually served each phase, which may differ after failover.
    pub selected_server: TestServer,
    pub download: Option<PhaseOutcome>,
    pub upload: Option<PhaseOutcome>,
}

pub struct MeasurementSession<S: SessionSink> {
    options: SessionOptions,
    sink: Arc<S>,
    locator: LocatorClient,
    cancelled: AtomicBool,
    active_stop: Mutex<Option<StopHandle>>,
}

impl<S: SessionSink> MeasurementSession<S> {
    pub fn new(sink: S) -> Result<Self, ClientError> {
        Self::with_options(sink, SessionOptions::default())
    }

    pub fn with_options(sink: S, options: SessionOptions) -> Result<Self, ClientError> {
        let locator = LocatorClient::new(&options.locator_url)?;
        Ok(Self {
            options,
            sink: Arc::new(sink),
            locator,
            cancelled: AtomicBool::new(false),
            active_stop: Mutex::new(None),
        })
    }

    /// Cooperatively stop the active phase, if any. Safe at any time; the
    /// session does not block on tear-down.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.active_stop.lock().as_ref() {
            handle.stop();
        }
    }

    /// Run discovery and the requested phase(s). Phases run sequentially;
    /// a failure in the download phase aborts the upload phase.
    pub async fn start(&self, test_type: TestType) -> Result<SessionReport, ClientError> {
        self.cancelled.store(false, Ordering::SeqCst);
        let servers = self.locator.nearest().await?;
        let selected = match servers.first() {
            Some(server) => server.clone(),
            None => return Err(ClientError::NoServersAvailable),
        };
        info!(
            "event=session_server_selected machine={} city={:?}",
            selected.machine, selected.location.city
        );
        self.sink.on_server_selected(&selected);

        let mut report = SessionReport {
            selected_server: selected,
            download: None,
            upload: None,
        };
        if test_type.wants_download() {
            report.download = Some(self.run_direction(&servers, Direction::Download).await?);
        }
        if test_type.wants_upload() {
            report.upload = Some(self.run_direction(&servers, Direction::Upload).await?);
        }
        Ok(report)
    }

    async fn run_direction(
        &self,
        servers: &[TestServer],
        direction: Direction,
    ) -> Result<PhaseOutcome, ClientError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ClientError::Cancelled);
        }
        info!("event=session_phase_start direction={:?}", direction);
        run_phase(servers, self.options.connection_mode, direction, |url| {
            self.attempt(url, direction)
        })
        .await
    }

    async fn attempt(&self, url: Url, direction: Direction) -> Result<PhaseResult, ClientError> {
        let config = PhaseConfig::new(url)
            .duration(self.options.duration)
            .device_name(self.options.device_name.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(events_rx, self.sink.clone(), direction));
        let result = match direction {
            Direction::Download => {
                let client = DownloadClient::new(config);
                self.install_stop(client.stop_handle());
                client.start(events_tx).await
            }
            Direction::Upload => {
                let client = UploadClient::new(config);
                self.install_stop(client.stop_handle());
                client.start(events_tx).await
            }
        };
        self.active_stop.lock().take();
        // The phase dropped its sender; drain the dispatcher so no callback
        // outlives the attempt.
        let _ = dispatcher.await;
        result
    }

    fn install_stop(&self, handle: StopHandle) {
        if self.cancelled.load(Ordering::SeqCst) {
            handle.stop();
        }
        *self.active_stop.lock() = Some(handle);
    }
}

/// Route phase events to the user sink, in order, off the I/O path.
async fn dispatch<S: SessionSink>(
    mut events: mpsc::UnboundedReceiver<PhaseEvent>,
    sink: Arc<S>,
    direction: Direction,
) {
    while let Some(event) = events.recv().await {
        match event {
            PhaseEvent::Progress(progress) => match direction {
                Direction::Download => sink.on_download_progress(progress),
                Direction::Upload => sink.on_upload_progress(progress),
            },
            PhaseEvent::Measurement(measurement) => match direction {
                Direction::Download => sink.on_download_measurement(measurement),
                Direction::Upload => sink.on_upload_measurement(measurement),
            },
            PhaseEvent::Finished { progress, error } => {
                debug!(
                    "event=session_phase_finished direction={:?} bytes={} error={:?}",
                    direction, progress.num_bytes, error
                );
            }
        }
    }
}
