//! Shared backend state

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use sikreg_core::codec;
use sikreg_core::config::ServerConfig;
use sikreg_core::protocol::{INVALID_UDI_MESSAGE, LoginResponse, TestCheckRequest, TestCheckResponse};
use sikreg_core::{Mode, Section};

/// Result reported while a test has not been seen yet
pub const RESULT_PENDING: &str = "PENDING";

/// Result reported for UDIs that never registered
pub const RESULT_UNKNOWN: &str = "UNKNOWN";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("{}", INVALID_UDI_MESSAGE)]
    InvalidUdi,

    #[error("Missing section key")]
    MissingKey,
}

/// One registered section
#[derive(Debug, Clone)]
pub struct Registration {
    pub mode: Mode,
    pub sik: Option<String>,
    pub stream_url: String,
    pub registered_at: DateTime<Utc>,
    pub checks: u32,
    pub passed_at: Option<DateTime<Utc>>,
}

/// Shared application state
pub struct BackendState {
    pub election: String,
    pub stream_base_url: String,
    /// Handed to clients to decrypt later QR codes (base64)
    pub keyenc: String,
    pub checks_until_ok: u32,
    /// Empty accepts any UDI
    pub known_udis: HashSet<String>,
    pub registrations: HashMap<String, Registration>,
}

impl BackendState {
    pub fn from_config(config: &ServerConfig) -> Self {
        let keyenc = config.keyenc.clone().unwrap_or_else(|| {
            tracing::info!("Generated random keyenc (will change on restart)");
            codec::encode_key(&codec::generate_key())
        });

        Self {
            election: config.election.clone(),
            stream_base_url: config.stream_base_url.trim_end_matches('/').to_string(),
            keyenc,
            checks_until_ok: config.checks_until_ok,
            known_udis: config.known_udis.iter().cloned().collect(),
            registrations: HashMap::new(),
        }
    }

    /// Register a section and allocate its stream
    pub fn register(&mut self, section: &Section) -> Result<LoginResponse, RegisterError> {
        let udi = section.udi_or_empty().trim();
        if udi.is_empty() || (!self.known_udis.is_empty() && !self.known_udis.contains(udi)) {
            return Err(RegisterError::InvalidUdi);
        }
        if section.key.trim().is_empty() {
            return Err(RegisterError::MissingKey);
        }

        let stream_url = format!("{}/{}", self.stream_base_url, uuid::Uuid::new_v4().simple());
        tracing::info!(udi, mode = %section.mode, "Registered section");

        self.registrations.insert(
            udi.to_string(),
            Registration {
                mode: section.mode.clone(),
                sik: section.sik.clone(),
                stream_url: stream_url.clone(),
                registered_at: Utc::now(),
                checks: 0,
                passed_at: None,
            },
        );

        Ok(LoginResponse {
            stream_url,
            election: self.election.clone(),
            keyenc: Some(self.keyenc.clone()),
        })
    }

    /// Count a check; OK once `checks_until_ok` checks have been made
    pub fn record_check(&mut self, request: &TestCheckRequest) -> TestCheckResponse {
        let Some(registration) = self.registrations.get_mut(request.udi.trim()) else {
            return TestCheckResponse {
                result: RESULT_UNKNOWN.to_string(),
                error: Some("Section not registered".to_string()),
            };
        };

        registration.checks += 1;
        if registration.checks < self.checks_until_ok {
            return TestCheckResponse::pending(RESULT_PENDING);
        }

        if registration.passed_at.is_none() {
            registration.passed_at = Some(Utc::now());
            tracing::info!(
                udi = %request.udi,
                mode = %request.mode,
                after = ?(Utc::now() - registration.registered_at),
                "Test passed"
            );
        }
        TestCheckResponse::ok()
    }
}
