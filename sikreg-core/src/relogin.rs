//! Re-login while streaming
//!
//! When the stream needs a fresh endpoint the client asks `/auth.php` again
//! with the current section, every few seconds, until it gets one. Every
//! failure schedules exactly one more attempt. The loop is unbounded unless
//! the policy says otherwise; the cancel handle ends it.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, BackendApi};
use crate::credentials::CredentialStore;
use crate::polling::{PollError, PollingClient, RetryPolicy, Step};
use crate::registration::{StreamEndpoint, persist_endpoint};
use crate::section::SectionStore;

pub struct Relogin {
    sections: SectionStore,
    credentials: Arc<dyn CredentialStore>,
    backend: Arc<dyn BackendApi>,
    policy: RetryPolicy,
    /// Replaced on `reset`, so a cancelled loop can be started again
    cancel: Mutex<CancellationToken>,
    logged_in_tx: watch::Sender<bool>,
}

impl Relogin {
    pub fn new(
        sections: SectionStore,
        credentials: Arc<dyn CredentialStore>,
        backend: Arc<dyn BackendApi>,
        policy: RetryPolicy,
    ) -> Self {
        let (logged_in_tx, _) = watch::channel(false);
        Self {
            sections,
            credentials,
            backend,
            policy,
            cancel: Mutex::new(CancellationToken::new()),
            logged_in_tx,
        }
    }

    /// Ends `run` at the next attempt boundary. Valid until the next `reset`.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Arm a fresh cancel handle and clear the logged-in flag, for the next
    /// dropped stream. A loop still running is cancelled.
    pub fn reset(&self) {
        let previous = std::mem::replace(
            &mut *self.cancel.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        previous.cancel();
        self.logged_in_tx.send_replace(false);
    }

    /// Flips to `true` once a new endpoint is stored
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.logged_in_tx.subscribe()
    }

    pub async fn run(&self) -> Result<StreamEndpoint, PollError<ApiError>> {
        let backend = self.backend.as_ref();
        let sections = &self.sections;

        let client = PollingClient::with_cancellation(self.policy, self.cancel_handle());
        let result = client
            .execute(|state| async move {
                let section = sections.current();
                match backend.login(&section).await {
                    Ok(resp) => Step::Ready(resp),
                    Err(e) => {
                        tracing::warn!("Re-login attempt {} failed: {}", state.attempt, e);
                        Step::Pending(e)
                    }
                }
            })
            .await;

        let endpoint = StreamEndpoint::from(result?);
        persist_endpoint(self.credentials.as_ref(), &endpoint);
        tracing::info!("Re-login succeeded");
        self.logged_in_tx.send_replace(true);
        Ok(endpoint)
    }
}
