//! Single request/response cycle against the target service.
//!
//! [`RequestExecutor`] is the seam between the engine and the HTTP stack:
//! virtual users hand it a [`RequestSpec`] and always get a
//! [`RequestOutcome`] back. Transport failures are captured on the outcome
//! instead of being returned as errors, so a failing target never tears
//! down a virtual user.

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use tokio::time::Instant;

use crate::loadtest::error::RequestError;

/// A fully-formed request to send.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// HTTP method.
    pub method: Method,
    /// Absolute target URL.
    pub url: String,
    /// Request headers in send order.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<String>,
}

impl RequestSpec {
    /// Creates a `GET` request with no headers and no body.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Timing breakdown of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// Time from send until the response head arrived.
    pub waiting: Duration,
    /// Time spent reading the response body.
    pub receiving: Duration,
    /// Time from send until the full response was received (or the failure).
    pub total: Duration,
}

impl Timings {
    /// Timings for a request whose phases were not observed separately.
    pub fn from_total(total: Duration) -> Self {
        Self {
            waiting: total,
            receiving: Duration::ZERO,
            total,
        }
    }
}

/// Result of one executor invocation.
///
/// `status` is `None` when no response head was received. A body read
/// failure keeps the status but also sets `error`.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// HTTP status code, if a response head was received.
    pub status: Option<u16>,
    /// Response body decoded as UTF-8 (lossy).
    pub body: String,
    /// Number of body bytes received.
    pub bytes_received: u64,
    /// Timing breakdown.
    pub timings: Timings,
    /// Transport error, if any.
    pub error: Option<RequestError>,
}

impl RequestOutcome {
    /// An outcome for a completed response.
    pub fn response(status: u16, body: impl Into<String>, timings: Timings) -> Self {
        let body = body.into();
        Self {
            status: Some(status),
            bytes_received: body.len() as u64,
            body,
            timings,
            error: None,
        }
    }

    /// An outcome for a request that never produced a response.
    pub fn failure(error: RequestError, timings: Timings) -> Self {
        Self {
            status: None,
            body: String::new(),
            bytes_received: 0,
            timings,
            error: Some(error),
        }
    }

    /// Total request duration.
    pub fn duration(&self) -> Duration {
        self.timings.total
    }

    /// Returns `true` if the request errored or the status is outside
    /// the expected `200..400` range.
    pub fn is_failed(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        !matches!(self.status, Some(code) if (200..400).contains(&code))
    }

    /// Parses the body as JSON. Returns `None` for non-JSON bodies.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Performs one request/response cycle with a timeout.
///
/// Implementations must not panic or return early on transport failures;
/// those are reported through [`RequestOutcome::error`].
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Sends `request` and waits at most `timeout` for the full response.
    async fn execute(&self, request: &RequestSpec, timeout: Duration) -> RequestOutcome;
}

/// [`RequestExecutor`] backed by a shared [`reqwest::Client`].
///
/// The client is cheap to clone and pools connections, so one executor is
/// shared by every virtual user.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    /// Creates an executor with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor around an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: &RequestSpec, timeout: Duration) -> RequestOutcome {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                return RequestOutcome::failure(
                    RequestError::classify_reqwest(&err),
                    Timings::from_total(start.elapsed()),
                );
            },
        };
        let waiting = start.elapsed();
        let status = response.status().as_u16();

        match response.bytes().await {
            Ok(bytes) => {
                let total = start.elapsed();
                let mut outcome = RequestOutcome::response(
                    status,
                    String::from_utf8_lossy(&bytes).into_owned(),
                    Timings {
                        waiting,
                        receiving: total.saturating_sub(waiting),
                        total,
                    },
                );
                outcome.bytes_received = bytes.len() as u64;
                outcome
            },
            Err(err) => {
                let total = start.elapsed();
                RequestOutcome {
                    status: Some(status),
                    body: String::new(),
                    bytes_received: 0,
                    timings: Timings {
                        waiting,
                        receiving: total.saturating_sub(waiting),
                        total,
                    },
                    error: Some(RequestError::classify_reqwest(&err)),
                }
            },
        }
    }
}
