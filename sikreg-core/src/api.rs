//! Backend REST client
//!
//! `BackendApi` is the seam the state machines talk to. `HttpBackend` is the
//! reqwest implementation; tests substitute scripted fakes.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::BackendConfig;
use crate::protocol::{
    AUTH_PATH, CHECK_PATH, ErrorBody, INVALID_UDI_MESSAGE, LoginResponse, TestCheckRequest,
    TestCheckResponse,
};
use crate::section::Section;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Non-2xx answer. `message` is what the server said.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Message as surfaced to the state machines
    pub fn message(&self) -> String {
        match self {
            ApiError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// The server refused the device identifier
    pub fn is_invalid_udi(&self) -> bool {
        matches!(self, ApiError::Rejected { message, .. } if message == INVALID_UDI_MESSAGE)
    }
}

/// Backend operations used by the registration and test-result flows
pub trait BackendApi: Send + Sync {
    /// Exchange a section for a streaming endpoint (`/auth.php`)
    fn login<'a>(&'a self, section: &'a Section) -> BoxFuture<'a, Result<LoginResponse, ApiError>>;

    /// Ask whether the section's test has finished (`/check.php`)
    fn check_test_result<'a>(
        &'a self,
        request: &'a TestCheckRequest,
    ) -> BoxFuture<'a, Result<TestCheckResponse, ApiError>>;
}

/// reqwest-backed client
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    /// Client with reqwest's default timeouts
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: normalize_base_url(base_url),
        }
    }

    /// Client with the configured connect and request timeouts
    pub fn from_config(config: &BackendConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: normalize_base_url(&config.base_url),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("POST {}", url);

        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(rejection(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(format!("{path}: {e}")))
    }
}

impl BackendApi for HttpBackend {
    fn login<'a>(&'a self, section: &'a Section) -> BoxFuture<'a, Result<LoginResponse, ApiError>> {
        self.post_json(AUTH_PATH, section).boxed()
    }

    fn check_test_result<'a>(
        &'a self,
        request: &'a TestCheckRequest,
    ) -> BoxFuture<'a, Result<TestCheckResponse, ApiError>> {
        self.post_json(CHECK_PATH, request).boxed()
    }
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Turn a non-2xx answer into `ApiError::Rejected`, preferring the JSON message
fn rejection(status: reqwest::StatusCode, body: &str) -> ApiError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.text().map(str::to_string))
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    ApiError::Rejected {
        status: status.as_u16(),
        message,
    }
}
