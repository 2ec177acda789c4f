//! M-Lab locator collaborator: server discovery over the locate v2 API.

use crate::error::LocatorError;
use crate::measurement::Direction;
use crate::retry::RetryPolicy;
use crate::timeouts::{LOCATOR_CONNECT_TIMEOUT, LOCATOR_REQUEST_TIMEOUT};
use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Public M-Lab locate endpoint for NDT7.
pub const DEFAULT_LOCATOR_URL: &str = "https://locate.measurementlab.net/v2/nearest/ndt/ndt7";

const LOCATOR_RETRY_ATTEMPTS: usize = 3;
const LOCATOR_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Which URL pair of a [`TestServer`] to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Secure,
    Insecure,
}

/// Geographic hint attached to a measurement server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TestLocation {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

/// The four phase endpoints of one server, keyed as locate v2 returns them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TargetUrls {
    #[serde(rename = "wss:///ndt/v7/download", default)]
    pub download_secure: Option<String>,
    #[serde(rename = "wss:///ndt/v7/upload", default)]
    pub upload_secure: Option<String>,
    #[serde(rename = "ws:///ndt/v7/download", default)]
    pub download_insecure: Option<String>,
    #[serde(rename = "ws:///ndt/v7/upload", default)]
    pub upload_insecure: Option<String>,
}

/// One ranked measurement server. Immutable after decode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestServer {
    pub machine: String,
    #[serde(default)]
    pub location: TestLocation,
    pub urls: TargetUrls,
}

impl TestServer {
    /// Resolve the endpoint for a mode/direction pair, if the locator
    /// provided one.
    pub fn url_for(&self, mode: ConnectionMode, direction: Direction) -> Option<&str> {
        let slot = match (mode, direction) {
            (ConnectionMode::Secure, Direction::Download) => &self.urls.download_secure,
            (ConnectionMode::Secure, Direction::Upload) => &self.urls.upload_secure,
            (ConnectionMode::Insecure, Direction::Download) => &self.urls.download_insecure,
            (ConnectionMode::Insecure, Direction::Upload) => &self.urls.upload_insecure,
        };
        slot.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct LocateResponse {
    #[serde(default)]
    results: Vec<TestServer>,
}

/// One-shot JSON client for the locate endpoint.
pub struct LocatorClient {
    http: reqwest::Client,
    endpoint: Url,
    retry_policy: RetryPolicy,
}

impl LocatorClient {
    pub fn new(endpoint: impl AsRef<str>) -> Result<Self, LocatorError> {
        let endpoint =
            Url::parse(endpoint.as_ref()).map_err(|err| LocatorError::Url(err.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(LOCATOR_REQUEST_TIMEOUT)
            .connect_timeout(LOCATOR_CONNECT_TIMEOUT)
            .build()
            .map_err(LocatorError::from)?;
        Ok(Self {
            http,
            endpoint,
            retry_policy: RetryPolicy::fixed(LOCATOR_RETRY_ATTEMPTS, LOCATOR_RETRY_BACKOFF)
                .with_skip_first_delay(true),
        })
    }

    /// Fetch the ranked server list. Transport-level failures are retried;
    /// status-level outcomes are mapped and returned as-is.
    pub async fn nearest(&self) -> Result<Vec<TestServer>, LocatorError> {
        let mut retry = self.retry_policy.handle();
        loop {
            match self.nearest_once().await {
                Ok(servers) => return Ok(servers),
                Err(err @ LocatorError::Request(_)) => {
                    warn!("event=locator_request_error error={err}");
                    match retry.next_delay() {
                        Some(delay) => {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn nearest_once(&self) -> Result<Vec<TestServer>, LocatorError> {
        debug!("event=locator_request url={}", self.endpoint);
        let response = self.http.get(self.endpoint.clone()).send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LocatorError::RateLimited);
        }
        if !status.is_success() {
            return Err(LocatorError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }
        let decoded: LocateResponse = response.json().await?;
        if decoded.results.is_empty() {
            return Err(LocatorError::OutOfCapacity);
        }
        debug!("event=locator_response servers={}", decoded.results.len());
        Ok(decoded.results)
    }
}
