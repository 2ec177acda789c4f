//! Measurement records: locally computed progress samples and the
//! server-reported NDT7 measurement frames.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Which half of the test a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

/// A locally computed throughput sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeasurementProgress {
    pub elapsed_ns: u64,
    pub num_bytes: u64,
    pub direction: Direction,
    pub mean_throughput_mbps: f64,
}

impl MeasurementProgress {
    /// Sample the counter against a phase start instant.
    pub fn from_start(start: Instant, num_bytes: u64, direction: Direction) -> Self {
        Self::at_elapsed(start.elapsed(), num_bytes, direction)
    }

    pub(crate) fn at_elapsed(elapsed: Duration, num_bytes: u64, direction: Direction) -> Self {
        let elapsed_ns = elapsed.as_nanos().min(u128::from(u64::MAX)) as u64;
        Self {
            elapsed_ns,
            num_bytes,
            direction,
            mean_throughput_mbps: mean_throughput_mbps(num_bytes, elapsed_ns),
        }
    }
}

/// Mean throughput in megabits per second over the whole elapsed window.
fn mean_throughput_mbps(num_bytes: u64, elapsed_ns: u64) -> f64 {
    let seconds = elapsed_ns.max(1) as f64 / NANOS_PER_SEC;
    (num_bytes as f64 * 8.0) / seconds / 1_000_000.0
}

/// Who produced a server measurement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementOrigin {
    Client,
    Server,
}

/// Application-level counters reported by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(rename = "NumBytes", default)]
    pub num_bytes: i64,
    /// Microseconds since the start of the peer's measurement window.
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time: i64,
}

/// Endpoint identity echoed by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "Client", default)]
    pub client: Option<String>,
    #[serde(rename = "Server", default)]
    pub server: Option<String>,
    #[serde(rename = "UUID", default)]
    pub uuid: Option<String>,
}

/// Kernel TCP statistics, as far as the server exposes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpInfo {
    #[serde(rename = "RTT", default)]
    pub rtt: Option<i64>,
    #[serde(rename = "RTTVar", default)]
    pub rtt_var: Option<i64>,
    #[serde(rename = "MinRTT", default)]
    pub min_rtt: Option<i64>,
    #[serde(rename = "BytesSent", default)]
    pub bytes_sent: Option<i64>,
    #[serde(rename = "BytesReceived", default)]
    pub bytes_received: Option<i64>,
    #[serde(rename = "BytesRetrans", default)]
    pub bytes_retrans: Option<i64>,
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time: Option<i64>,
}

/// BBR sender state, present only on BBR-enabled servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BbrInfo {
    #[serde(rename = "BW", default)]
    pub bw: Option<i64>,
    #[serde(rename = "MinRTT", default)]
    pub min_rtt: Option<i64>,
    #[serde(rename = "PacingGain", default)]
    pub pacing_gain: Option<f64>,
    #[serde(rename = "CwndGain", default)]
    pub cwnd_gain: Option<f64>,
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time: Option<i64>,
}

/// One server-reported measurement frame, decoded from a TEXT message.
///
/// Only `app_info` is load-bearing for the client; everything else is
/// carried through for the caller. Unknown fields are tolerated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestMeasurement {
    #[serde(rename = "AppInfo", default)]
    pub app_info: AppInfo,
    #[serde(rename = "ConnectionInfo", default)]
    pub connection_info: Option<ConnectionInfo>,
    #[serde(rename = "TCPInfo", default)]
    pub tcp_info: Option<TcpInfo>,
    #[serde(rename = "BBRInfo", default)]
    pub bbr_info: Option<BbrInfo>,
    #[serde(rename = "Origin", default)]
    pub origin: Option<MeasurementOrigin>,
    #[serde(rename = "Test", default)]
    pub test: Option<Direction>,
}
