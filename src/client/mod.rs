//! Phase clients: one attempt of one NDT7 phase against one server URL.
//!
//! A phase client lives for exactly one attempt. It opens the WebSocket,
//! runs until one terminal condition fires (server close, deadline, error,
//! or cooperative stop), resolves the single-shot finish latch, emits the
//! terminal event, and tears down before `start` returns.

mod download;
mod upload;

pub use download::DownloadClient;
pub use upload::UploadClient;

use crate::error::{ClientError, ProtocolErrorKind, TransportErrorKind};
use crate::measurement::{MeasurementProgress, SpeedTestMeasurement};
use crate::timeouts::{CLOSE_GRACE, MEASUREMENT_DURATION_DEFAULT};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderName;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

/// NDT7 subprotocol announced on the opening handshake.
pub const NDT7_SUBPROTOCOL: &str = "net.measurementlab.ndt.v7";

/// Upper bound on incoming frames.
pub(crate) const MAX_FRAME_SIZE: usize = 1 << 24;
/// Initial upload buffer size (8 KiB).
pub(crate) const MIN_MESSAGE_SIZE: usize = 1 << 13;
/// Upload buffer ceiling (16 MiB).
pub(crate) const MAX_MESSAGE_SIZE: usize = 1 << 24;
/// Doubling criterion: grow once this many buffers of the current size went
/// through the link.
pub(crate) const MESSAGE_SCALE_FACTOR: u64 = 16;

pub(crate) const DEVICE_NAME_HEADER: &str = "x-device-name";
const CLIENT_USER_AGENT: &str = concat!("netgauge/", env!("CARGO_PKG_VERSION"));

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything one phase attempt needs to run.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub url: Url,
    pub device_name: Option<String>,
    pub duration: Duration,
}

impl PhaseConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            device_name: None,
            duration: MEASUREMENT_DURATION_DEFAULT,
        }
    }

    pub fn device_name(mut self, device_name: Option<String>) -> Self {
        self.device_name = device_name;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration.max(Duration::from_millis(1));
        self
    }
}

/// The condition that ended a phase. Exactly one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    NormalClose,
    Timeout,
    Protocol(ProtocolErrorKind),
    Transport(TransportErrorKind),
    Cancelled,
}

impl Terminal {
    pub fn is_success(&self) -> bool {
        matches!(self, Terminal::NormalClose | Terminal::Timeout)
    }

    pub fn error(&self) -> Option<ClientError> {
        match self {
            Terminal::NormalClose | Terminal::Timeout => None,
            Terminal::Protocol(kind) => Some(ClientError::Protocol(*kind)),
            Terminal::Transport(kind) => Some(ClientError::Transport(*kind)),
            Terminal::Cancelled => Some(ClientError::Cancelled),
        }
    }
}

/// Terminal record of one attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseResult {
    pub bytes_transferred: u64,
    pub terminal: Terminal,
}

/// Typed event stream emitted by a phase client. `Finished` is always the
/// last event; nothing follows it.
#[derive(Debug, Clone)]
pub enum PhaseEvent {
    Progress(MeasurementProgress),
    Measurement(SpeedTestMeasurement),
    Finished {
        progress: MeasurementProgress,
        error: Option<ClientError>,
    },
}

/// Clonable handle that cooperatively aborts a running phase. Idempotent.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub(crate) fn new(signal: Arc<watch::Sender<bool>>) -> Self {
        Self { signal }
    }

    pub fn stop(&self) {
        let _ = self.signal.send(true);
    }
}

/// Single-shot completion latch: `Running -> Done(terminal)`, first
/// transition wins. Serializes the deadline, stream, and stop races.
#[derive(Debug)]
pub(crate) struct FinishLatch {
    state: Mutex<Option<Terminal>>,
}

impl FinishLatch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    pub(crate) fn resolve(&self, terminal: Terminal) -> bool {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(terminal);
            true
        } else {
            false
        }
    }

    pub(crate) fn terminal(&self) -> Option<Terminal> {
        *self.state.lock()
    }
}

pub(crate) fn terminal_from_error(err: &ClientError) -> Terminal {
    match err {
        ClientError::Protocol(kind) => Terminal::Protocol(*kind),
        ClientError::Transport(kind) => Terminal::Transport(*kind),
        ClientError::Cancelled => Terminal::Cancelled,
        _ => Terminal::Transport(TransportErrorKind::Io),
    }
}

/// Emit the terminal event and convert the latch outcome into the value of
/// the `start` future.
pub(crate) fn finish_phase(
    events: &mpsc::UnboundedSender<PhaseEvent>,
    progress: MeasurementProgress,
    terminal: Terminal,
) -> Result<PhaseResult, ClientError> {
    let error = terminal.error();
    let _ = events.send(PhaseEvent::Finished {
        progress,
        error: error.clone(),
    });
    match error {
        None => Ok(PhaseResult {
            bytes_transferred: progress.num_bytes,
            terminal,
        }),
        Some(err) => Err(err),
    }
}

/// Open the measurement WebSocket with the NDT7 handshake headers.
pub(crate) async fn connect(config: &PhaseConfig) -> Result<WsStream, ClientError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| crate::error::classify_ws_error(&err))?;
    let headers = request.headers_mut();
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(NDT7_SUBPROTOCOL),
    );
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
    if let Some(device) = &config.device_name {
        let value = HeaderValue::from_str(device).map_err(|_| ClientError::TestFailed(
            format!("device name is not a valid header value: {device}"),
        ))?;
        headers.insert(HeaderName::from_static(DEVICE_NAME_HEADER), value);
    }

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_frame_size = Some(MAX_FRAME_SIZE);
    ws_config.max_message_size = Some(MAX_FRAME_SIZE);

    let (stream, response) = connect_async_with_config(request, Some(ws_config), true)
        .await
        .map_err(|err| crate::error::classify_ws_error(&err))?;
    debug!(
        "event=ndt7_handshake_complete url={} status={}",
        config.url,
        response.status()
    );
    Ok(stream)
}

/// Best-effort normal CLOSE with a short grace window.
pub(crate) async fn close_quietly(ws: &mut WsStream) {
    let close = ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }));
    match tokio::time::timeout(CLOSE_GRACE, close).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("event=ndt7_close_error error={err}"),
        Err(_) => debug!("event=ndt7_close_timeout"),
    }
}
