//! Registration and test-result failure kinds
//!
//! `ErrorType` is the closed set of failures a client surfaces to the operator.
//! Module-level errors (`DecodeError`, `ApiError`, ...) are mapped into it at the
//! state machine boundary, so observers only ever deal with these variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds surfaced by the registration and test-result flows.
///
/// The `Display` text is the human-readable message shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    #[error("Internal server error, please try again later")]
    ServerError,

    #[error("The device identifier (UDI) was rejected by the server")]
    InvalidUdi,

    #[error("Failed to store the device identifier (UDI)")]
    FailedStoringUdi,

    #[error("Failed to store the section data")]
    FailedStoringSection,

    #[error("The scanned QR code is not valid")]
    BadQr,

    #[error("No internet connection")]
    NoInternet,

    #[error("Could not obtain a streaming address")]
    GetRtmpUrlError,

    #[error("Failed to store the streaming address")]
    FailedStoringRtmpUrl,

    #[error("The initial setup test did not complete")]
    FailedInitialTest,

    #[error("The section test did not complete")]
    FailedSikTest,
}

impl ErrorType {
    /// All variants, in declaration order
    pub const ALL: [ErrorType; 10] = [
        ErrorType::ServerError,
        ErrorType::InvalidUdi,
        ErrorType::FailedStoringUdi,
        ErrorType::FailedStoringSection,
        ErrorType::BadQr,
        ErrorType::NoInternet,
        ErrorType::GetRtmpUrlError,
        ErrorType::FailedStoringRtmpUrl,
        ErrorType::FailedInitialTest,
        ErrorType::FailedSikTest,
    ];
}
