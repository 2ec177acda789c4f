//! Error taxonomy for the measurement client.
//!
//! Protocol-level kinds are kept as data (not boxed sources) so the retry
//! driver can classify them without string matching; the substring fallback
//! below exists for WebSocket stacks that do not expose structured codes.

use std::fmt;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Structural WebSocket-level failures. The first three indicate the server
/// is incompatible with this client and further attempts against it are
/// pointless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    UnknownControlOpcode,
    InvalidReservedBits,
    FragmentedControlFrame,
    HandshakeRejected,
    NoData,
}

impl ProtocolErrorKind {
    /// Whether this kind aborts all remaining attempts against the server.
    pub fn skips_server(self) -> bool {
        matches!(
            self,
            ProtocolErrorKind::UnknownControlOpcode
                | ProtocolErrorKind::InvalidReservedBits
                | ProtocolErrorKind::FragmentedControlFrame
        )
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolErrorKind::UnknownControlOpcode => "unknown_control_opcode",
            ProtocolErrorKind::InvalidReservedBits => "invalid_reserved_bits",
            ProtocolErrorKind::FragmentedControlFrame => "fragmented_control_frame",
            ProtocolErrorKind::HandshakeRejected => "handshake_rejected",
            ProtocolErrorKind::NoData => "no_data",
        };
        f.write_str(name)
    }
}

/// Transient TCP/TLS-level failures; always worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Io,
    Tls,
    Timeout,
    ConnectionReset,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Io => "io",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ConnectionReset => "connection_reset",
        };
        f.write_str(name)
    }
}

/// Errors emitted by the locator collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocatorError {
    #[error("locator returned no servers")]
    OutOfCapacity,
    #[error("locator rate limited")]
    RateLimited,
    #[error("locator returned HTTP {status}")]
    UnexpectedStatus { status: u16 },
    #[error("locator request failed: {0}")]
    Request(String),
    #[error("locator response decode failed: {0}")]
    Decode(String),
    #[error("invalid locator URL: {0}")]
    Url(String),
}

impl From<reqwest::Error> for LocatorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LocatorError::Decode(err.to_string())
        } else {
            LocatorError::Request(err.to_string())
        }
    }
}

/// Top-level error surface of the crate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("invalid test URL: {reason}")]
    InvalidTestUrl { reason: String },
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error("test failed: {0}")]
    TestFailed(String),
    #[error("protocol error: {0}")]
    Protocol(ProtocolErrorKind),
    #[error("transport error: {0}")]
    Transport(TransportErrorKind),
    #[error("measurement cancelled")]
    Cancelled,
    #[error("no measurement servers available")]
    NoServersAvailable,
}

impl ClientError {
    /// Whether the retry driver should abandon the current server outright.
    pub fn skips_server(&self) -> bool {
        matches!(self, ClientError::Protocol(kind) if kind.skips_server())
    }
}

/// Map a WebSocket-stack error onto the crate taxonomy.
///
/// Structured inspection of `tungstenite::Error` is the primary path; the
/// human-message fallback catches stacks (or future versions) that surface
/// the canonical failures only as text.
pub(crate) fn classify_ws_error(err: &tungstenite::Error) -> ClientError {
    use tungstenite::error::ProtocolError as WsProtocol;
    match err {
        tungstenite::Error::Protocol(protocol) => match protocol {
            WsProtocol::NonZeroReservedBits => {
                ClientError::Protocol(ProtocolErrorKind::InvalidReservedBits)
            }
            WsProtocol::UnknownControlFrameType(_) | WsProtocol::UnknownDataFrameType(_) => {
                ClientError::Protocol(ProtocolErrorKind::UnknownControlOpcode)
            }
            WsProtocol::FragmentedControlFrame => {
                ClientError::Protocol(ProtocolErrorKind::FragmentedControlFrame)
            }
            WsProtocol::ResetWithoutClosingHandshake => {
                ClientError::Transport(TransportErrorKind::ConnectionReset)
            }
            other => fallback_classify(&other.to_string()),
        },
        tungstenite::Error::Http(_) => ClientError::Protocol(ProtocolErrorKind::HandshakeRejected),
        tungstenite::Error::Tls(_) => ClientError::Transport(TransportErrorKind::Tls),
        tungstenite::Error::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::TimedOut => ClientError::Transport(TransportErrorKind::Timeout),
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::UnexpectedEof => {
                ClientError::Transport(TransportErrorKind::ConnectionReset)
            }
            _ => ClientError::Transport(TransportErrorKind::Io),
        },
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ClientError::Transport(TransportErrorKind::ConnectionReset)
        }
        other => fallback_classify(&other.to_string()),
    }
}

fn fallback_classify(message: &str) -> ClientError {
    match protocol_kind_from_message(message) {
        Some(kind) => ClientError::Protocol(kind),
        None => ClientError::Transport(TransportErrorKind::Io),
    }
}

/// Substring fallback against the three canonical structural failures.
pub(crate) fn protocol_kind_from_message(message: &str) -> Option<ProtocolErrorKind> {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("reserved bit") || lowered.contains("invalid_reserved_bits") {
        Some(ProtocolErrorKind::InvalidReservedBits)
    } else if lowered.contains("unknown control") || lowered.contains("unknown_control_opcode") {
        Some(ProtocolErrorKind::UnknownControlOpcode)
    } else if lowered.contains("fragmented control") || lowered.contains("control frame fragment") {
        Some(ProtocolErrorKind::FragmentedControlFrame)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_kinds_skip_server() {
        assert!(ProtocolErrorKind::UnknownControlOpcode.skips_server());
        assert!(ProtocolErrorKind::InvalidReservedBits.skips_server());
        assert!(ProtocolErrorKind::FragmentedControlFrame.skips_server());
        assert!(!ProtocolErrorKind::HandshakeRejected.skips_server());
        assert!(!ProtocolErrorKind::NoData.skips_server());
    }

    #[test]
    fn substring_fallback_matches_canonical_strings() {
        assert_eq!(
            protocol_kind_from_message("Reserved bits are non-zero"),
            Some(ProtocolErrorKind::InvalidReservedBits)
        );
        assert_eq!(
            protocol_kind_from_message("Unknown control frame type: 11"),
            Some(ProtocolErrorKind::UnknownControlOpcode)
        );
        assert_eq!(
            protocol_kind_from_message("Control frame fragmented"),
            Some(ProtocolErrorKind::FragmentedControlFrame)
        );
        assert_eq!(protocol_kind_from_message("connection reset by peer"), None);
    }

    #[test]
    fn structured_classification_precedes_fallback() {
        use tungstenite::error::ProtocolError as WsProtocol;
        let err = tungstenite::Error::Protocol(WsProtocol::NonZeroReservedBits);
        assert_eq!(
            classify_ws_error(&err),
            ClientError::Protocol(ProtocolErrorKind::InvalidReservedBits)
        );
        let err = tungstenite::Error::Protocol(WsProtocol::ResetWithoutClosingHandshake);
        assert_eq!(
            classify_ws_error(&err),
            ClientError::Transport(TransportErrorKind::ConnectionReset)
        );
    }

    #[test]
    fn io_errors_map_to_transport_kinds() {
        let err = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "socket timeout",
        ));
        assert_eq!(
            classify_ws_error(&err),
            ClientError::Transport(TransportErrorKind::Timeout)
        );
        let err = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert_eq!(
            classify_ws_error(&err),
            ClientError::Transport(TransportErrorKind::ConnectionReset)
        );
    }
}
