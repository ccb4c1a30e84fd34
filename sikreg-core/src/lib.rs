//! sikreg-core: Section registration client library
//!
//! This crate provides:
//! - QR payload codec (plaintext JSON or ChaCha20-Poly1305 sealed)
//! - The shared current-section holder
//! - Registration, re-login and test-result state machines
//! - Credential persistence and the backend REST client

pub mod api;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod error;
pub mod polling;
pub mod protocol;
pub mod registration;
pub mod relogin;
pub mod section;
pub mod test_result;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, BackendApi, HttpBackend};
pub use codec::DecodeError;
pub use config::Config;
pub use connectivity::{Reachability, StaticReachability, TcpReachability};
pub use credentials::{CredentialKey, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::ErrorType;
pub use polling::{PollError, PollingClient, RetryPolicy, Step};
pub use registration::{RegistrationMachine, RegistrationReport, RegistrationState, StreamEndpoint};
pub use relogin::Relogin;
pub use section::{Mode, QrPayload, Section, SectionStore};
pub use test_result::{LoadingState, TestResultFlow};

/// Default port of the stub backend
pub const DEFAULT_BACKEND_PORT: u16 = 9290;
