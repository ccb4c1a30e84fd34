//! Backend wire types
//!
//! All bodies are JSON:
//! - `POST /auth.php`  request: `Section`, response: `LoginResponse`
//! - `POST /check.php` request: `TestCheckRequest`, response: `TestCheckResponse`
//! - failures: non-2xx with `ErrorBody` or a plain-text message

use serde::{Deserialize, Serialize};

use crate::section::Mode;

/// Path of the registration endpoint
pub const AUTH_PATH: &str = "/auth.php";

/// Path of the test-result endpoint
pub const CHECK_PATH: &str = "/check.php";

/// Business result marking a finished test
pub const RESULT_OK: &str = "OK";

/// Failure message that selects `ErrorType::InvalidUdi`
pub const INVALID_UDI_MESSAGE: &str = "Invalid UDI";

/// Successful `/auth.php` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub stream_url: String,
    pub election: String,
    /// Key for decrypting later QR codes (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyenc: Option<String>,
}

/// `/check.php` request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCheckRequest {
    pub mode: Mode,
    pub udi: String,
}

/// `/check.php` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCheckResponse {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestCheckResponse {
    /// Finished and passed: `result == "OK"` with no error
    pub fn is_ok(&self) -> bool {
        self.result == RESULT_OK && self.error.as_deref().is_none_or(|e| e.trim().is_empty())
    }

    pub fn ok() -> Self {
        Self {
            result: RESULT_OK.to_string(),
            error: None,
        }
    }

    pub fn pending(result: &str) -> Self {
        Self {
            result: result.to_string(),
            error: None,
        }
    }
}

/// Error body returned with non-2xx statuses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            message: None,
        }
    }

    /// The human-readable part, whichever field carries it
    pub fn text(&self) -> Option<&str> {
        self.error.as_deref().or(self.message.as_deref())
    }
}
