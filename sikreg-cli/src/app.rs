//! Wiring between the config and the core flows

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use sikreg_core::codec;
use sikreg_core::connectivity::CONNECT_TIMEOUT;
use sikreg_core::{
    Config, CredentialKey, CredentialStore, FileCredentialStore, HttpBackend, LoadingState,
    MemoryCredentialStore, Mode, Reachability, RegistrationMachine, RegistrationReport, Relogin, Section,
    SectionStore, StaticReachability, TcpReachability, TestResultFlow,
};

/// Credentials as shown to the operator
#[derive(Debug, Serialize)]
pub struct StoredCredentials {
    pub udi: String,
    pub rtmp_url: String,
    pub election: String,
    /// Masked
    pub keyenc: Option<String>,
}

/// What `register` did
#[derive(Debug)]
pub struct RegisterOutcome {
    pub report: RegistrationReport,
    /// Final test-result state, when a check was asked for
    pub check: Option<LoadingState>,
}

impl RegisterOutcome {
    /// Error if either the registration or the check failed
    pub fn into_result(self) -> anyhow::Result<()> {
        let checked = self.check.map_or(Ok(()), check_result);
        match (self.report.failure, checked) {
            (Some(kind), Err(e)) => Err(e.context(kind)),
            (Some(kind), Ok(())) => Err(kind.into()),
            (None, checked) => checked,
        }
    }
}

/// Map a finished check to the command's result
pub fn check_result(state: LoadingState) -> anyhow::Result<()> {
    match state {
        LoadingState::Success => Ok(()),
        LoadingState::Failure(kind) => Err(kind.into()),
        LoadingState::Start | LoadingState::Loading => anyhow::bail!("Check cancelled"),
    }
}

/// Main application struct
pub struct App {
    pub config: Config,
    pub sections: SectionStore,
    pub credentials: Arc<dyn CredentialStore>,
    backend: Arc<HttpBackend>,
}

impl App {
    pub fn new(config: Config, ephemeral: bool) -> anyhow::Result<Self> {
        let credentials: Arc<dyn CredentialStore> = if ephemeral {
            Arc::new(MemoryCredentialStore::new())
        } else {
            let dir = config.storage_dir().context("No credential directory")?;
            tracing::debug!("Credentials in {}", dir.display());
            Arc::new(FileCredentialStore::new(dir))
        };
        let backend = Arc::new(HttpBackend::from_config(&config.backend).context("Failed to build HTTP client")?);

        Ok(Self {
            config,
            sections: SectionStore::new(),
            credentials,
            backend,
        })
    }

    pub fn registration(&self) -> RegistrationMachine {
        RegistrationMachine::new(
            self.sections.clone(),
            self.credentials.clone(),
            self.backend.clone(),
            self.reachability(),
            self.config.registration.retry_policy(),
        )
    }

    pub fn test_result_flow(&self) -> TestResultFlow {
        TestResultFlow::new(
            self.sections.clone(),
            self.credentials.clone(),
            self.backend.clone(),
            self.config.test_result.retry_policy(),
        )
    }

    pub fn relogin(&self) -> Relogin {
        Relogin::new(
            self.sections.clone(),
            self.credentials.clone(),
            self.backend.clone(),
            self.config.relogin.retry_policy(),
        )
    }

    /// Register one scan, then optionally confirm the test stream. A failed
    /// registration does not skip the check.
    pub async fn register<F>(&self, raw: &str, check: bool, on_check: F) -> RegisterOutcome
    where
        F: FnOnce(CancellationToken),
    {
        let report = self.registration().handle_scan(raw).await;
        if let Some(kind) = report.failure {
            tracing::warn!("Registration failed: {}", kind);
        }

        let check = if check {
            Some(self.check_test_result(on_check).await)
        } else {
            None
        };
        RegisterOutcome { report, check }
    }

    /// Poll the test result for the current section. `on_start` receives the
    /// flow's cancel handle before the first request.
    pub async fn check_test_result<F>(&self, on_start: F) -> LoadingState
    where
        F: FnOnce(CancellationToken),
    {
        let flow = self.test_result_flow();
        on_start(flow.cancel_handle());
        flow.check().await
    }

    /// Decode a QR payload and make it the current section
    pub fn load_section(&self, raw: &str) -> anyhow::Result<Section> {
        let payload = codec::decode_scanned(raw, self.credentials.as_ref()).context("Invalid QR payload")?;
        let section = Section::from(payload);
        self.sections.replace(section.clone());
        Ok(section)
    }

    /// Make a bare section for checking a test stream
    pub fn load_check_section(&self, mode: &str, udi: Option<String>) -> Section {
        let section = Section {
            mode: Mode::parse(mode),
            udi,
            sik: None,
            key: String::new(),
        };
        self.sections.replace(section.clone());
        section
    }

    /// Base64 sealed payload, using `key` or else the stored keyenc
    pub fn seal(&self, json: &str, key: Option<&str>) -> anyhow::Result<String> {
        let encoded = match key {
            Some(k) => k.to_string(),
            None => self
                .credentials
                .get_keyenc()
                .context("No key given and no keyenc stored (register first)")?,
        };
        let key = codec::decode_key(&encoded).context("Key must be 32 bytes, base64")?;
        Ok(codec::seal_to_text(json, &key)?)
    }

    pub fn stored(&self) -> StoredCredentials {
        StoredCredentials {
            udi: self.credentials.get(CredentialKey::Udi),
            rtmp_url: self.credentials.get(CredentialKey::RtmpUrl),
            election: self.credentials.get(CredentialKey::Election),
            keyenc: self.credentials.get_keyenc().map(|k| mask(&k)),
        }
    }

    fn reachability(&self) -> Arc<dyn Reachability> {
        match TcpReachability::for_base_url(&self.config.backend.base_url, CONNECT_TIMEOUT) {
            Some(target) => Arc::new(target),
            None => {
                tracing::warn!(
                    "No host in {}, skipping connectivity check",
                    self.config.backend.base_url
                );
                Arc::new(StaticReachability(true))
            }
        }
    }
}

fn mask(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}****")
}
