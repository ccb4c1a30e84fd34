//! Section registration state machine
//!
//! ```text
//! ScanQrCode ──scan ok, online──▶ GetRtmpUrl ──login ok──▶ Success
//!     │                               │                      ▲
//!     └──bad QR / offline──▶ Failure(kind) ◀──login failed───┘
//!                                 │                          │
//!                                 └──────────────────────────┘
//! ```
//!
//! A failure never blocks the operator: once reported, the machine moves on to
//! `Success` so the test or election still gets recorded. The next scan starts
//! again from `ScanQrCode`.
//!
//! States are published on a watch channel. Observers see the latest state
//! only; the full sequence of one scan is returned in its `RegistrationReport`.

use std::sync::Arc;

use tokio::sync::watch;

use crate::api::{ApiError, BackendApi};
use crate::codec;
use crate::connectivity::Reachability;
use crate::credentials::{CredentialKey, CredentialStore};
use crate::error::ErrorType;
use crate::polling::{PollError, PollingClient, RetryPolicy, Step};
use crate::protocol::LoginResponse;
use crate::section::{Section, SectionStore};

/// Registration flow states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    ScanQrCode,
    GetRtmpUrl,
    Success,
    Failure(ErrorType),
}

/// Where to stream, as handed out by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub url: String,
    pub election: String,
    /// Key for decrypting later QR codes (base64)
    pub key_encryption_key: Option<String>,
}

impl From<LoginResponse> for StreamEndpoint {
    fn from(resp: LoginResponse) -> Self {
        Self {
            url: resp.stream_url,
            election: resp.election,
            key_encryption_key: resp.keyenc,
        }
    }
}

/// Result of handling one scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Section stored by this scan, if the QR decoded
    pub section: Option<Section>,
    pub endpoint: Option<StreamEndpoint>,
    pub failure: Option<ErrorType>,
    /// Every state entered, in order
    pub transitions: Vec<RegistrationState>,
}

impl RegistrationReport {
    pub fn is_registered(&self) -> bool {
        self.endpoint.is_some()
    }
}

pub struct RegistrationMachine {
    sections: SectionStore,
    credentials: Arc<dyn CredentialStore>,
    backend: Arc<dyn BackendApi>,
    reachability: Arc<dyn Reachability>,
    login_policy: RetryPolicy,
    state_tx: watch::Sender<RegistrationState>,
    transitions: Vec<RegistrationState>,
}

impl RegistrationMachine {
    pub fn new(
        sections: SectionStore,
        credentials: Arc<dyn CredentialStore>,
        backend: Arc<dyn BackendApi>,
        reachability: Arc<dyn Reachability>,
        login_policy: RetryPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(RegistrationState::ScanQrCode);
        Self {
            sections,
            credentials,
            backend,
            reachability,
            login_policy,
            state_tx,
            transitions: Vec::new(),
        }
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> RegistrationState {
        self.state_tx.borrow().clone()
    }

    /// Leave `Success` for the next scan
    pub fn acknowledge(&mut self) {
        if self.state() == RegistrationState::Success {
            self.transition(RegistrationState::ScanQrCode);
        }
    }

    /// Run one scan through the whole flow. Always ends in `Success`.
    pub async fn handle_scan(&mut self, raw: &str) -> RegistrationReport {
        match self.state() {
            RegistrationState::ScanQrCode => {}
            RegistrationState::Success => self.acknowledge(),
            other => {
                tracing::warn!("Scan received in state {:?}, restarting registration", other);
                self.transition(RegistrationState::ScanQrCode);
            }
        }
        self.transitions.clear();

        let section = match self.scan(raw) {
            Ok(section) => section,
            Err(kind) => return self.fail(kind, None),
        };

        if !self.reachability.is_online().await {
            return self.fail(ErrorType::NoInternet, Some(section));
        }

        self.transition(RegistrationState::GetRtmpUrl);

        let current = self.sections.current();
        match self.request_endpoint(&current).await {
            Ok(endpoint) => {
                persist_endpoint(self.credentials.as_ref(), &endpoint);
                tracing::info!(election = %endpoint.election, "Section registered");
                self.transition(RegistrationState::Success);
                self.report(Some(current), Some(endpoint), None)
            }
            Err(kind) => self.fail(kind, Some(current)),
        }
    }

    /// Decode the QR, remember its UDI and make it the current section
    fn scan(&self, raw: &str) -> Result<Section, ErrorType> {
        let payload = codec::decode_scanned(raw, self.credentials.as_ref()).map_err(|e| {
            tracing::warn!("Failed to decode QR: {}", e);
            ErrorType::BadQr
        })?;

        let section = Section::from(payload);
        self.sections.replace(section.clone());
        Ok(section)
    }

    async fn request_endpoint(&self, section: &Section) -> Result<StreamEndpoint, ErrorType> {
        let client = PollingClient::new(self.login_policy);
        let backend = self.backend.as_ref();

        let result = client
            .execute(|_| async move {
                match backend.login(section).await {
                    Ok(resp) => Step::Ready(resp),
                    // The server's answer on the UDI is final
                    Err(e) if e.is_invalid_udi() => Step::Abort(e),
                    Err(e) => Step::Pending(e),
                }
            })
            .await;

        result.map(StreamEndpoint::from).map_err(|err| {
            tracing::warn!("Login failed: {}", err);
            login_failure_kind(&err)
        })
    }

    fn fail(&mut self, kind: ErrorType, section: Option<Section>) -> RegistrationReport {
        tracing::warn!(error = ?kind, "Registration failed: {}", kind);
        self.transition(RegistrationState::Failure(kind));
        self.transition(RegistrationState::Success);
        self.report(section, None, Some(kind))
    }

    fn transition(&mut self, state: RegistrationState) {
        tracing::info!("Registration state: {:?}", state);
        self.transitions.push(state.clone());
        self.state_tx.send_replace(state);
    }

    fn report(
        &mut self,
        section: Option<Section>,
        endpoint: Option<StreamEndpoint>,
        failure: Option<ErrorType>,
    ) -> RegistrationReport {
        RegistrationReport {
            section,
            endpoint,
            failure,
            transitions: std::mem::take(&mut self.transitions),
        }
    }
}

/// "Invalid UDI" selects `InvalidUdi`, anything else is `GetRtmpUrlError`
pub fn login_failure_kind(err: &PollError<ApiError>) -> ErrorType {
    match err.last_error() {
        Some(e) if e.is_invalid_udi() => ErrorType::InvalidUdi,
        _ => ErrorType::GetRtmpUrlError,
    }
}

/// Store what the backend handed out. Failures are logged, never surfaced.
pub fn persist_endpoint(credentials: &dyn CredentialStore, endpoint: &StreamEndpoint) {
    if let Err(e) = credentials.set(CredentialKey::RtmpUrl, &endpoint.url) {
        tracing::warn!("{}: {}", ErrorType::FailedStoringRtmpUrl, e);
    }
    if let Err(e) = credentials.set(CredentialKey::Election, &endpoint.election) {
        tracing::warn!("{}: {}", ErrorType::FailedStoringSection, e);
    }
    if let Some(keyenc) = &endpoint.key_encryption_key {
        if let Err(e) = credentials.store_keyenc(keyenc) {
            tracing::warn!("{}: {}", ErrorType::FailedStoringSection, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{KEY_LEN, encode_key, seal_to_text};
    use crate::connectivity::StaticReachability;
    use crate::credentials::MemoryCredentialStore;
    use crate::section::Mode;
    use crate::testing::{FailingCredentialStore, FakeBackend, endpoint_response, rejected, unavailable};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        machine: RegistrationMachine,
        sections: SectionStore,
        credentials: Arc<MemoryCredentialStore>,
        backend: Arc<FakeBackend>,
    }

    fn harness(backend: FakeBackend, online: bool) -> Harness {
        let sections = SectionStore::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let backend = Arc::new(backend);
        let machine = RegistrationMachine::new(
            sections.clone(),
            credentials.clone(),
            backend.clone(),
            Arc::new(StaticReachability(online)),
            RetryPolicy::bounded(3, Duration::from_millis(5000)),
        );
        Harness {
            machine,
            sections,
            credentials,
            backend,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_registration() {
        let mut h = harness(FakeBackend::new(), true);

        let report = h
            .machine
            .handle_scan(r#"{"mode":"real","udi":"U7","sik":"S1","key":"abc"}"#)
            .await;

        assert_eq!(
            report.transitions,
            vec![RegistrationState::GetRtmpUrl, RegistrationState::Success]
        );
        assert!(report.is_registered());
        assert_eq!(report.failure, None);
        assert_eq!(h.machine.state(), RegistrationState::Success);

        let endpoint = endpoint_response();
        assert_eq!(h.credentials.get(CredentialKey::RtmpUrl), endpoint.stream_url);
        assert_eq!(h.credentials.get(CredentialKey::Election), endpoint.election);
        assert_eq!(h.credentials.get_keyenc(), endpoint.keyenc);
        assert_eq!(h.credentials.get(CredentialKey::Udi), "U7");

        let sent = h.backend.last_section.lock().unwrap().clone().unwrap();
        assert_eq!(sent, h.sections.current());
        assert_eq!(sent.mode, Mode::Real);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_udi_is_backfilled() {
        let mut h = harness(FakeBackend::new(), true);
        h.credentials.set(CredentialKey::Udi, "U1").unwrap();

        let report = h.machine.handle_scan(r#"{"mode":"real","udi":"","key":"abc"}"#).await;

        let expected = Section {
            mode: Mode::Real,
            udi: Some("U1".to_string()),
            sik: None,
            key: "abc".to_string(),
        };
        assert_eq!(report.section, Some(expected.clone()));
        assert_eq!(h.sections.current(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_scan_with_stored_key() {
        let mut h = harness(FakeBackend::new(), true);
        let key = [3u8; KEY_LEN];
        h.credentials.store_keyenc(&encode_key(&key)).unwrap();

        let text = seal_to_text(r#"{"mode":"test-sik","sik":"S1","key":"k"}"#, &key).unwrap();
        let report = h.machine.handle_scan(&text).await;

        let section = h.sections.current();
        assert_eq!(section.mode, Mode::TestSik);
        assert_eq!(section.sik.as_deref(), Some("S1"));
        assert!(report.is_registered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_qr_still_reaches_success() {
        let mut h = harness(FakeBackend::new(), true);

        let report = h.machine.handle_scan("not a qr code at all!").await;

        assert_eq!(
            report.transitions,
            vec![
                RegistrationState::Failure(ErrorType::BadQr),
                RegistrationState::Success
            ]
        );
        assert_eq!(report.failure, Some(ErrorType::BadQr));
        assert_eq!(h.backend.login_calls.load(Ordering::SeqCst), 0);
        assert!(h.sections.current().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_scan_without_key_is_bad_qr() {
        let mut h = harness(FakeBackend::new(), true);
        let text = seal_to_text(r#"{"mode":"real","key":"k"}"#, &[3u8; KEY_LEN]).unwrap();

        let report = h.machine.handle_scan(&text).await;
        assert_eq!(report.failure, Some(ErrorType::BadQr));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_after_scan() {
        let mut h = harness(FakeBackend::new(), false);

        let report = h.machine.handle_scan(r#"{"mode":"real","udi":"U1","key":"abc"}"#).await;

        assert_eq!(
            report.transitions,
            vec![
                RegistrationState::Failure(ErrorType::NoInternet),
                RegistrationState::Success
            ]
        );
        // The section is kept for the test-result flow
        assert_eq!(h.sections.current().udi.as_deref(), Some("U1"));
        assert_eq!(h.backend.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_udi_is_not_retried() {
        let backend = FakeBackend::new().with_login(|_| Err(rejected("Invalid UDI")));
        let mut h = harness(backend, true);

        let report = h.machine.handle_scan(r#"{"mode":"real","udi":"U1","key":"abc"}"#).await;

        assert_eq!(
            report.transitions,
            vec![
                RegistrationState::GetRtmpUrl,
                RegistrationState::Failure(ErrorType::InvalidUdi),
                RegistrationState::Success
            ]
        );
        assert_eq!(h.backend.login_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.credentials.get(CredentialKey::RtmpUrl), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_login_failures() {
        let backend = FakeBackend::new().with_login(|_| Err(unavailable()));
        let mut h = harness(backend, true);

        let report = h.machine.handle_scan(r#"{"mode":"real","udi":"U1","key":"abc"}"#).await;

        assert_eq!(report.failure, Some(ErrorType::GetRtmpUrlError));
        assert_eq!(h.machine.state(), RegistrationState::Success);
        assert_eq!(h.backend.login_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_recovers_within_retry_budget() {
        let backend = FakeBackend::new().with_login(|call| {
            if call < 2 { Err(unavailable()) } else { Ok(endpoint_response()) }
        });
        let mut h = harness(backend, true);

        let report = h.machine.handle_scan(r#"{"mode":"real","udi":"U1","key":"abc"}"#).await;

        assert!(report.is_registered());
        assert_eq!(h.backend.login_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_scan_starts_over() {
        let mut h = harness(FakeBackend::new(), true);
        let mut rx = h.machine.subscribe();

        h.machine.handle_scan("garbage!").await;
        assert_eq!(*rx.borrow_and_update(), RegistrationState::Success);

        let report = h.machine.handle_scan(r#"{"mode":"test-setup","udi":"U1","key":"abc"}"#).await;
        assert!(report.is_registered());
        assert_eq!(h.sections.current().mode, Mode::TestSetup);

        h.machine.acknowledge();
        assert_eq!(h.machine.state(), RegistrationState::ScanQrCode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failures_do_not_change_the_flow() {
        let sections = SectionStore::new();
        let backend = Arc::new(FakeBackend::new());
        let mut machine = RegistrationMachine::new(
            sections.clone(),
            Arc::new(FailingCredentialStore),
            backend.clone(),
            Arc::new(StaticReachability(true)),
            RetryPolicy::bounded(3, Duration::from_millis(5000)),
        );

        let report = machine
            .handle_scan(r#"{"mode":"test-setup","udi":"U1","key":"abc"}"#)
            .await;

        assert_eq!(
            report.transitions,
            vec![RegistrationState::GetRtmpUrl, RegistrationState::Success]
        );
        assert!(report.is_registered());
        assert_eq!(report.failure, None);
        assert_eq!(report.endpoint, Some(StreamEndpoint::from(endpoint_response())));
        assert_eq!(sections.current().udi.as_deref(), Some("U1"));
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_login_failure_kind() {
        let invalid = PollError::Aborted {
            attempt: 1,
            error: rejected("Invalid UDI"),
        };
        assert_eq!(login_failure_kind(&invalid), ErrorType::InvalidUdi);

        let other = PollError::Exhausted {
            attempts: 3,
            last: rejected("Section closed"),
        };
        assert_eq!(login_failure_kind(&other), ErrorType::GetRtmpUrlError);

        let cancelled: PollError<ApiError> = PollError::Cancelled { attempts: 0 };
        assert_eq!(login_failure_kind(&cancelled), ErrorType::GetRtmpUrlError);
    }
}
