//! Centralized timing policy for the measurement pipeline.
//!
//! Keeping the wire-mandated values in one place makes it clear which parts
//! of the system share behaviour (phase deadlines, retry spacing, progress
//! cadence) and gives us a single knob to turn if we need to tighten or
//! relax limits.

use std::time::Duration;

/// Default length of one measurement phase (download or upload).
pub const MEASUREMENT_DURATION_DEFAULT: Duration = Duration::from_secs(10);
/// Delay between consecutive attempts against the same server.
pub const INTER_ATTEMPT_DELAY: Duration = Duration::from_millis(2000);
/// Minimum spacing between locally computed progress samples.
pub const MEASUREMENT_REPORT_INTERVAL: Duration = Duration::from_millis(250);
/// Overall deadline for one locator request.
pub const LOCATOR_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// TCP connect deadline for the locator request.
pub const LOCATOR_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period granted to a best-effort CLOSE frame during tear-down.
pub const CLOSE_GRACE: Duration = Duration::from_millis(250);
/// Grace period granted to the upload writer task when asked to stop.
pub const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
