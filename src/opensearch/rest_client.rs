//! Thin REST client for OpenSearch and the DBaaS components
//!
//! Idempotent requests are retried on transport failures and 5xx answers
//! with a capped exponential backoff.

use std::time::Duration;

use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Timings;
use crate::error::{Error, Result};

/// Basic-auth credentials; requests go unauthenticated when either part is empty
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub max_backoff: Duration,
}

impl From<&Timings> for RetryPolicy {
    fn from(timings: &Timings) -> Self {
        Self {
            retries: timings.http_retries,
            max_backoff: timings.http_max_backoff,
        }
    }
}

/// A response as seen by callers that interpret status codes themselves
#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Clone, Debug)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        client: reqwest::Client,
        credentials: Option<Credentials>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            credentials: credentials.filter(Credentials::is_complete),
            retry,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a request and return the raw status and body
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response> {
        let idempotent = matches!(
            method,
            Method::GET | Method::PUT | Method::DELETE | Method::HEAD
        );
        let max_attempts = if idempotent { self.retry.retries + 1 } else { 1 };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(method.clone(), path, body).await {
                Ok(response) if response.status.is_server_error() && attempt < max_attempts => {
                    warn!(
                        %method, path, status = response.status.as_u16(), attempt,
                        "Server error, retrying request"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) if attempt < max_attempts && is_transient(&e) => {
                    warn!(%method, path, attempt, "Transient HTTP failure, retrying request: {e}");
                }
                Err(e) => return Err(Error::HttpError(e)),
            }
            tokio::time::sleep(backoff(attempt - 1, self.retry.max_backoff)).await;
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Response, reqwest::Error> {
        let mut request = self
            .client
            .request(method.clone(), self.url(path))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%method, path, status = status.as_u16(), "REST call finished");
        Ok(Response { status, body })
    }

    /// Send a request and fail with [`Error::RemoteApi`] on any non-2xx answer
    pub async fn send_checked(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<String> {
        let response = self.send(method.clone(), path, body).await?;
        if !response.is_success() {
            return Err(Error::RemoteApi {
                method: method.to_string(),
                path: path.to_string(),
                status: response.status.as_u16(),
                body: response.body,
            });
        }
        Ok(response.body)
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.send_checked(Method::GET, path, None).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

/// Exponential backoff starting at 250ms, capped at `max`, with up to 10% jitter
pub fn backoff(attempt: u32, max: Duration) -> Duration {
    let base = Duration::from_millis(250).saturating_mul(2_u32.saturating_pow(attempt.min(10)));
    let capped = base.min(max);
    let jitter_ms = (capped.as_millis() as u64) / 10;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    capped.saturating_sub(Duration::from_millis(jitter))
}
