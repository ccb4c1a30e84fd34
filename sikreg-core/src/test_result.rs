//! Test-result confirmation
//!
//! After registration in a test mode the backend needs a moment to see the
//! stream. The client polls `/check.php` at a fixed interval until it answers
//! OK or the attempt budget runs out. Exhaustion is final for this flow.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, BackendApi};
use crate::credentials::{CredentialKey, CredentialStore};
use crate::error::ErrorType;
use crate::polling::{PollError, PollingClient, RetryPolicy, Step};
use crate::protocol::TestCheckRequest;
use crate::section::{Mode, SectionStore};

/// Progress of the test-result check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadingState {
    Start,
    Loading,
    Success,
    Failure(ErrorType),
}

/// Why a check did not count as finished
#[derive(Debug, Error)]
pub enum CheckPending {
    #[error("test not finished (result {result:?}, error {error:?})")]
    NotFinished {
        result: String,
        error: Option<String>,
    },

    #[error(transparent)]
    Transport(#[from] ApiError),
}

/// Failure reported when the attempt budget runs out
pub fn exhaustion_failure(mode: &Mode) -> ErrorType {
    match mode {
        Mode::TestSetup => ErrorType::FailedInitialTest,
        _ => ErrorType::FailedSikTest,
    }
}

pub struct TestResultFlow {
    sections: SectionStore,
    credentials: Arc<dyn CredentialStore>,
    backend: Arc<dyn BackendApi>,
    policy: RetryPolicy,
    /// Replaced on `restart`, so a cancelled flow can run again
    cancel: Mutex<CancellationToken>,
    state_tx: watch::Sender<LoadingState>,
}

impl TestResultFlow {
    pub fn new(
        sections: SectionStore,
        credentials: Arc<dyn CredentialStore>,
        backend: Arc<dyn BackendApi>,
        policy: RetryPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(LoadingState::Start);
        Self {
            sections,
            credentials,
            backend,
            policy,
            cancel: Mutex::new(CancellationToken::new()),
            state_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadingState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> LoadingState {
        self.state_tx.borrow().clone()
    }

    /// Stops a running check at its next attempt boundary. Valid until the
    /// next `restart`.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The request for the current section. The stored UDI wins over the
    /// section's own.
    pub fn request(&self) -> TestCheckRequest {
        let section = self.sections.current();
        let stored = self.credentials.get(CredentialKey::Udi);
        let udi = if stored.trim().is_empty() {
            section.udi_or_empty().to_string()
        } else {
            stored
        };

        TestCheckRequest {
            mode: section.mode,
            udi,
        }
    }

    /// Poll until the test finishes or the budget runs out
    pub async fn check(&self) -> LoadingState {
        let request = self.request();
        self.publish(LoadingState::Loading);
        tracing::info!(mode = %request.mode, "Checking test result");

        let client = PollingClient::with_cancellation(self.policy, self.cancel_handle());
        let backend = self.backend.as_ref();
        let req = &request;

        let result = client
            .execute(|state| async move {
                tracing::debug!("Test result check {}", state.attempt);
                match backend.check_test_result(req).await {
                    Ok(resp) if resp.is_ok() => Step::Ready(()),
                    Ok(resp) => Step::Pending(CheckPending::NotFinished {
                        result: resp.result,
                        error: resp.error,
                    }),
                    Err(e) => Step::Pending(CheckPending::Transport(e)),
                }
            })
            .await;

        let terminal = match result {
            Ok(()) => LoadingState::Success,
            Err(PollError::Cancelled { attempts }) => {
                tracing::info!("Test result check cancelled after {} attempts", attempts);
                LoadingState::Start
            }
            Err(err) => {
                tracing::warn!("Test result check failed: {}", err);
                LoadingState::Failure(exhaustion_failure(&request.mode))
            }
        };

        self.publish(terminal.clone());
        terminal
    }

    /// Start over: forget the current section and go back to `Start`.
    /// A running check is cancelled; later checks get a fresh cancel handle.
    pub fn restart(&self) {
        let previous = std::mem::replace(
            &mut *self.cancel.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        previous.cancel();
        self.sections.reset();
        self.publish(LoadingState::Start);
    }

    fn publish(&self, state: LoadingState) {
        tracing::debug!("Test result state: {:?}", state);
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::protocol::TestCheckResponse;
    use crate::section::Section;
    use crate::testing::{FakeBackend, unavailable};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn flow(backend: Arc<FakeBackend>, mode: Mode) -> (TestResultFlow, SectionStore) {
        let sections = SectionStore::new();
        sections.replace(Section {
            mode,
            udi: Some("U-section".to_string()),
            sik: Some("S1".to_string()),
            key: "k".to_string(),
        });
        let credentials = Arc::new(MemoryCredentialStore::new());
        credentials.set(CredentialKey::Udi, "U1").unwrap();

        let flow = TestResultFlow::new(
            sections.clone(),
            credentials,
            backend,
            RetryPolicy::bounded(6, Duration::from_millis(3000)),
        );
        (flow, sections)
    }

    fn never_ok() -> FakeBackend {
        FakeBackend::new().with_check(|_| Ok(TestCheckResponse::pending("PENDING")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_exhaustion() {
        let backend = Arc::new(never_ok());
        let (flow, _) = flow(backend.clone(), Mode::TestSetup);

        let state = flow.check().await;

        assert_eq!(state, LoadingState::Failure(ErrorType::FailedInitialTest));
        assert_eq!(flow.state(), state);
        assert_eq!(backend.check_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sik_exhaustion() {
        let backend = Arc::new(never_ok());
        let (flow, _) = flow(backend.clone(), Mode::TestSik);

        assert_eq!(flow.check().await, LoadingState::Failure(ErrorType::FailedSikTest));
        assert_eq!(backend.check_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_modes_fail_as_sik_test() {
        let backend = Arc::new(never_ok());
        let (flow, _) = flow(backend.clone(), Mode::Real);

        assert_eq!(flow.check().await, LoadingState::Failure(ErrorType::FailedSikTest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ok_on_third_attempt() {
        let backend = Arc::new(FakeBackend::new().with_check(|call| match call {
            1 => Err(unavailable()),
            2 => Ok(TestCheckResponse::pending("PENDING")),
            _ => Ok(TestCheckResponse::ok()),
        }));
        let (flow, _) = flow(backend.clone(), Mode::TestSetup);

        assert_eq!(flow.check().await, LoadingState::Success);
        assert_eq!(backend.check_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ok_with_error_is_not_finished() {
        let backend = Arc::new(FakeBackend::new().with_check(|_| {
            Ok(TestCheckResponse {
                result: "OK".to_string(),
                error: Some("no video".to_string()),
            })
        }));
        let (flow, _) = flow(backend.clone(), Mode::TestSik);

        assert_eq!(flow.check().await, LoadingState::Failure(ErrorType::FailedSikTest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_uses_stored_udi() {
        let backend = Arc::new(FakeBackend::new());
        let (flow, _) = flow(backend.clone(), Mode::TestSik);

        flow.check().await;

        let sent = backend.last_check.lock().unwrap().clone().unwrap();
        assert_eq!(sent.udi, "U1");
        assert_eq!(sent.mode, Mode::TestSik);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_falls_back_to_section_udi() {
        let sections = SectionStore::new();
        sections.replace(Section {
            mode: Mode::TestSetup,
            udi: Some("U-section".to_string()),
            sik: None,
            key: "k".to_string(),
        });
        let flow = TestResultFlow::new(
            sections,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(FakeBackend::new()),
            RetryPolicy::bounded(6, Duration::from_millis(3000)),
        );

        assert_eq!(flow.request().udi, "U-section");
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_loading_then_result() {
        let backend = Arc::new(never_ok());
        let (flow, _) = flow(backend, Mode::TestSetup);
        let flow = Arc::new(flow);
        let mut rx = flow.subscribe();

        let runner = Arc::clone(&flow);
        let task = tokio::spawn(async move { runner.check().await });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LoadingState::Loading);

        let terminal = task.await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_to_start() {
        let backend = Arc::new(never_ok());
        let (flow, _) = flow(backend.clone(), Mode::TestSetup);
        flow.cancel_handle().cancel();

        assert_eq!(flow.check().await, LoadingState::Start);
        assert_eq!(backend.check_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_runs_again_after_cancel_and_restart() {
        let backend = Arc::new(FakeBackend::new());
        let (flow, sections) = flow(backend.clone(), Mode::TestSetup);
        let stale = flow.cancel_handle();
        stale.cancel();

        assert_eq!(flow.check().await, LoadingState::Start);
        assert_eq!(backend.check_calls.load(Ordering::SeqCst), 0);

        flow.restart();
        sections.replace(Section {
            mode: Mode::TestSetup,
            udi: Some("U1".to_string()),
            sik: None,
            key: "k".to_string(),
        });

        assert!(!flow.cancel_handle().is_cancelled());
        assert_eq!(flow.check().await, LoadingState::Success);
        assert_eq!(backend.check_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cancels_running_check() {
        let backend = Arc::new(never_ok());
        let (flow, _) = flow(backend.clone(), Mode::TestSik);
        let flow = Arc::new(flow);

        let runner = Arc::clone(&flow);
        let task = tokio::spawn(async move { runner.check().await });

        tokio::time::sleep(Duration::from_millis(3000 + 1)).await;
        flow.restart();

        assert_eq!(task.await.unwrap(), LoadingState::Start);
        assert_eq!(backend.check_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restart_resets_section() {
        let (flow, sections) = flow(Arc::new(FakeBackend::new()), Mode::TestSik);
        flow.check().await;
        assert_eq!(flow.state(), LoadingState::Success);

        flow.restart();
        assert_eq!(flow.state(), LoadingState::Start);
        assert_eq!(sections.current().mode, Mode::Unknown);
        assert!(sections.current().is_empty());
    }
}
