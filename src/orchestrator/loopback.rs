//! Loopback transport: hand a session token to the scheduler's own HTTP
//! endpoint so the session runs in a process that is not the caller's.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::config::LoopbackConfig;
use crate::{AppError, Result};

/// Token that asks the endpoint to echo the stored ping value instead of
/// running a session.
pub const PING_TOKEN: &str = "__ping__";

/// Request body accepted by the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopbackRequest {
    /// Session token, or [`PING_TOKEN`].
    pub token: String,
}

/// Endpoint reply to a ping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingResponse {
    /// Value currently stored under the ping key.
    pub ping: Option<String>,
}

/// Endpoint reply once a session run has been scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptedResponse {
    /// Session token that will be run.
    pub token: String,
    /// Always `true`; the run happens after the reply.
    pub accepted: bool,
}

/// Join a base URL and a route without doubling the slash.
#[must_use]
pub fn endpoint_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Client side of the loopback call.
pub trait LoopbackClient: Send + Sync {
    /// POST `{"token": token}` to `url` and return the response body.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Loopback` when the endpoint is unreachable, times
    /// out, or answers with a non-success status.
    fn post_token<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// [`LoopbackClient`] over `reqwest` with short timeouts.
pub struct HttpLoopbackClient {
    client: reqwest::Client,
}

impl HttpLoopbackClient {
    /// Build a client honouring the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Loopback` if the HTTP client cannot be built.
    pub fn new(config: &LoopbackConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| AppError::Loopback(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }
}

impl LoopbackClient for HttpLoopbackClient {
    fn post_token<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(url)
                .json(&LoopbackRequest {
                    token: token.to_owned(),
                })
                .send()
                .await
                .map_err(|err| AppError::Loopback(format!("request to {url} failed: {err}")))?
                .error_for_status()
                .map_err(|err| AppError::Loopback(format!("{url} rejected request: {err}")))?;
            response
                .text()
                .await
                .map_err(|err| AppError::Loopback(format!("unreadable response from {url}: {err}")))
        })
    }
}
