//! NDT7 (M-Lab) network-throughput measurement client.
//!
//! The crate discovers measurement servers through the M-Lab locator,
//! then runs download and/or upload phases over WebSocket, emitting both
//! locally computed progress samples and server-reported measurements.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod client;
pub mod driver;
pub mod error;
pub mod locator;
pub mod measurement;
pub mod retry;
pub mod session;
pub mod timeouts;

pub use client::{
    DownloadClient, PhaseConfig, PhaseEvent, PhaseResult, StopHandle, Terminal, UploadClient,
    NDT7_SUBPROTOCOL,
};
pub use driver::{run_phase, PhaseOutcome, PHASE_RETRY_ATTEMPTS};
pub use error::{ClientError, LocatorError, ProtocolErrorKind, TransportErrorKind};
pub use locator::{
    ConnectionMode, LocatorClient, TargetUrls, TestLocation, TestServer, DEFAULT_LOCATOR_URL,
};
pub use measurement::{
    AppInfo, BbrInfo, ConnectionInfo, Direction, MeasurementOrigin, MeasurementProgress,
    SpeedTestMeasurement, TcpInfo,
};
pub use retry::{RetryHandle, RetryPolicy};
pub use session::{
    MeasurementSession, NullSink, SessionOptions, SessionReport, SessionSink, TestType,
};
