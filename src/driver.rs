//! Retry & failover driver: runs one phase across the ranked server list.
//!
//! For each server in rank order the driver makes up to
//! [`PHASE_RETRY_ATTEMPTS`] attempts with a fixed inter-attempt delay. A
//! structural protocol error abandons the server immediately; everything
//! else is retried. The last observed error is what the caller gets when
//! the whole list is exhausted.

use crate::client::PhaseResult;
use crate::error::ClientError;
use crate::locator::{ConnectionMode, TestServer};
use crate::measurement::Direction;
use crate::retry::RetryPolicy;
use crate::timeouts::INTER_ATTEMPT_DELAY;
use log::{info, warn};
use std::future::Future;
use url::Url;

/// Attempts allowed against one server before moving on.
pub const PHASE_RETRY_ATTEMPTS: usize = 3;

/// The phase result together with the server that finally produced it.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub server: TestServer,
    pub result: PhaseResult,
}

/// Run one phase against the ranked list. The `attempt` future is built
/// fresh per attempt; injecting it keeps the schedule testable without a
/// network.
pub async fn run_phase<F, Fut>(
    servers: &[TestServer],
    mode: ConnectionMode,
    direction: Direction,
    mut attempt: F,
) -> Result<PhaseOutcome, ClientError>
where
    F: FnMut(Url) -> Fut,
    Fut: Future<Output = Result<PhaseResult, ClientError>>,
{
    let mut last_error: Option<ClientError> = None;
    for server in servers {
        let url = match resolve_url(server, mode, direction) {
            Ok(url) => url,
            Err(err) => {
                warn!(
                    "event=phase_url_invalid machine={} error={}",
                    server.machine, err
                );
                last_error = Some(err);
                continue;
            }
        };
        let mut retry = RetryPolicy::fixed(PHASE_RETRY_ATTEMPTS, INTER_ATTEMPT_DELAY).handle();
        loop {
            match attempt(url.clone()).await {
                Ok(result) if result.bytes_transferred > 0 => {
                    info!(
                        "event=phase_complete machine={} direction={:?} bytes={}",
                        server.machine, direction, result.bytes_transferred
                    );
                    return Ok(PhaseOutcome {
                        server: server.clone(),
                        result,
                    });
                }
                Ok(_) => {
                    warn!("event=phase_no_data machine={}", server.machine);
                    last_error = Some(ClientError::TestFailed("no data received".to_string()));
                }
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(err) if err.skips_server() => {
                    warn!(
                        "event=phase_server_skip machine={} error={}",
                        server.machine, err
                    );
                    last_error = Some(err);
                    break;
                }
                Err(err) => {
                    warn!(
                        "event=phase_attempt_error machine={} error={}",
                        server.machine, err
                    );
                    last_error = Some(err);
                }
            }
            match retry.next_delay() {
                Some(delay) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                None => break,
            }
        }
    }
    Err(last_error.unwrap_or(ClientError::NoServersAvailable))
}

fn resolve_url(
    server: &TestServer,
    mode: ConnectionMode,
    direction: Direction,
) -> Result<Url, ClientError> {
    let raw = server
        .url_for(mode, direction)
        .ok_or_else(|| ClientError::InvalidTestUrl {
            reason: format!(
                "server {} has no {:?} URL for {:?}",
                server.machine, direction, mode
            ),
        })?;
    let url = Url::parse(raw).map_err(|err| ClientError::InvalidTestUrl {
        reason: format!("{raw}: {err}"),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ClientError::InvalidTestUrl {
            reason: format!("unsupported scheme {other} in {raw}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{TargetUrls, TestLocation};

    fn server(machine: &str, download_secure: Option<&str>) -> TestServer {
        TestServer {
            machine: machine.to_string(),
            location: TestLocation::default(),
            urls: TargetUrls {
                download_secure: download_secure.map(str::to_string),
                ..TargetUrls::default()
            },
        }
    }

    #[test]
    fn resolve_url_accepts_websocket_schemes() {
        let srv = server("m1", Some("wss://m1.example/ndt/v7/download"));
        let url = resolve_url(&srv, ConnectionMode::Secure, Direction::Download).expect("url");
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn resolve_url_rejects_missing_slot() {
        let srv = server("m1", None);
        assert!(matches!(
            resolve_url(&srv, ConnectionMode::Secure, Direction::Download),
            Err(ClientError::InvalidTestUrl { .. })
        ));
    }

    #[test]
    fn resolve_url_rejects_foreign_scheme() {
        let srv = server("m1", Some("https://m1.example/ndt/v7/download"));
        assert!(matches!(
            resolve_url(&srv, ConnectionMode::Secure, Direction::Download),
            Err(ClientError::InvalidTestUrl { .. })
        ));
    }

    #[test]
    fn resolve_url_rejects_malformed_url() {
        let srv = server("m1", Some("not a url"));
        assert!(matches!(
            resolve_url(&srv, ConnectionMode::Secure, Direction::Download),
            Err(ClientError::InvalidTestUrl { .. })
        ));
    }
}
