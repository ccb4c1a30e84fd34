//! Scripted backend and credential store for unit tests

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::api::{ApiError, BackendApi};
use crate::credentials::{CredentialError, CredentialKey, CredentialStore};
use crate::protocol::{LoginResponse, TestCheckRequest, TestCheckResponse};
use crate::section::Section;

type LoginFn = Box<dyn Fn(u32) -> Result<LoginResponse, ApiError> + Send + Sync>;
type CheckFn = Box<dyn Fn(u32) -> Result<TestCheckResponse, ApiError> + Send + Sync>;

/// Answers are produced from the 1-based call number
pub(crate) struct FakeBackend {
    login: LoginFn,
    check: CheckFn,
    pub login_calls: AtomicU32,
    pub check_calls: AtomicU32,
    pub last_section: Mutex<Option<Section>>,
    pub last_check: Mutex<Option<TestCheckRequest>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            login: Box::new(|_| Ok(endpoint_response())),
            check: Box::new(|_| Ok(TestCheckResponse::ok())),
            login_calls: AtomicU32::new(0),
            check_calls: AtomicU32::new(0),
            last_section: Mutex::new(None),
            last_check: Mutex::new(None),
        }
    }

    pub fn with_login<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Result<LoginResponse, ApiError> + Send + Sync + 'static,
    {
        self.login = Box::new(f);
        self
    }

    pub fn with_check<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Result<TestCheckResponse, ApiError> + Send + Sync + 'static,
    {
        self.check = Box::new(f);
        self
    }
}

impl BackendApi for FakeBackend {
    fn login<'a>(&'a self, section: &'a Section) -> BoxFuture<'a, Result<LoginResponse, ApiError>> {
        let call = self.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_section.lock().unwrap() = Some(section.clone());
        futures::future::ready((self.login)(call)).boxed()
    }

    fn check_test_result<'a>(
        &'a self,
        request: &'a TestCheckRequest,
    ) -> BoxFuture<'a, Result<TestCheckResponse, ApiError>> {
        let call = self.check_calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_check.lock().unwrap() = Some(request.clone());
        futures::future::ready((self.check)(call)).boxed()
    }
}

pub(crate) fn endpoint_response() -> LoginResponse {
    LoginResponse {
        stream_url: "rtmp://stream.example/live/abc".to_string(),
        election: "Local 2026".to_string(),
        keyenc: Some("c2VjcmV0LWtleS1mb3ItbGF0ZXItcXItY29kZXMhIQ==".to_string()),
    }
}

pub(crate) fn rejected(message: &str) -> ApiError {
    ApiError::Rejected {
        status: 403,
        message: message.to_string(),
    }
}

/// Stand-in for a transport failure
pub(crate) fn unavailable() -> ApiError {
    ApiError::Rejected {
        status: 503,
        message: "Service Unavailable".to_string(),
    }
}

/// Reads nothing back and refuses every write
pub(crate) struct FailingCredentialStore;

fn read_only() -> CredentialError {
    CredentialError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only storage"))
}

impl CredentialStore for FailingCredentialStore {
    fn get(&self, _key: CredentialKey) -> String {
        String::new()
    }

    fn set(&self, _key: CredentialKey, _value: &str) -> Result<(), CredentialError> {
        Err(read_only())
    }

    fn get_keyenc(&self) -> Option<String> {
        None
    }

    fn store_keyenc(&self, _keyenc: &str) -> Result<(), CredentialError> {
        Err(read_only())
    }
}
