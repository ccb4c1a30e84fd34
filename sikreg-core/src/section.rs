//! Section model and the shared current-section holder
//!
//! A `Section` is the registration unit: what was scanned from the QR code,
//! normalized. The process keeps exactly one current section in a
//! `SectionStore`, which is handed out as a cheap cloneable handle rather than
//! living in a global.
//!
//! Writers follow a single-writer-per-phase discipline: the scan phase calls
//! `replace`, the test-result restart calls `reset`, everything else only reads.
//! The store makes each call atomic but offers nothing across a read followed
//! by a write.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;

/// Registration mode carried by the QR code
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Initial device setup test
    TestSetup,
    /// Test of an already set up section
    TestSik,
    /// Election day
    Real,
    /// Blank mode
    #[default]
    Unknown,
    /// Any other mode string, passed through to the backend as scanned
    Other(String),
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Mode::TestSetup => "test-setup",
            Mode::TestSik => "test-sik",
            Mode::Real => "real",
            Mode::Unknown => "unknown",
            Mode::Other(raw) => raw,
        }
    }

    /// Normalize a raw mode string. Only blank values become `Unknown`;
    /// unrecognized ones keep their text.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "test-setup" => Mode::TestSetup,
            "test-sik" => Mode::TestSik,
            "real" => Mode::Real,
            "" | "unknown" => Mode::Unknown,
            _ => {
                tracing::debug!("Unrecognized section mode {:?}, passing it through", raw);
                Mode::Other(raw.to_string())
            }
        }
    }
}

impl From<&str> for Mode {
    fn from(raw: &str) -> Self {
        Mode::parse(raw)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Mode::parse).unwrap_or_default())
    }
}

/// Fields scanned from a QR code, before normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    #[serde(default)]
    pub mode: String,
    pub udi: Option<String>,
    pub sik: Option<String>,
    pub key: String,
}

impl QrPayload {
    /// True when the payload carries no usable UDI
    pub fn udi_is_blank(&self) -> bool {
        self.udi.as_deref().is_none_or(|udi| udi.trim().is_empty())
    }
}

/// The registration unit. Serializes to the `/auth.php` request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub mode: Mode,
    pub udi: Option<String>,
    pub sik: Option<String>,
    pub key: String,
}

impl Section {
    /// Placeholder held before the first scan and after a reset
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    /// UDI or the empty string
    pub fn udi_or_empty(&self) -> &str {
        self.udi.as_deref().unwrap_or_default()
    }
}

impl From<QrPayload> for Section {
    fn from(payload: QrPayload) -> Self {
        Self {
            mode: Mode::parse(&payload.mode),
            udi: payload.udi,
            sik: payload.sik,
            key: payload.key,
        }
    }
}

/// Handle to the single current section of this process
#[derive(Debug, Clone)]
pub struct SectionStore {
    inner: Arc<watch::Sender<Section>>,
}

impl Default for SectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Section::empty());
        Self { inner: Arc::new(tx) }
    }

    /// Replace the current section wholesale
    pub fn replace(&self, section: Section) {
        tracing::debug!(mode = %section.mode, "Section replaced");
        self.inner.send_replace(section);
    }

    /// Snapshot of the current section
    pub fn current(&self) -> Section {
        self.inner.borrow().clone()
    }

    /// Back to the empty placeholder
    pub fn reset(&self) {
        tracing::debug!("Section reset");
        self.inner.send_replace(Section::empty());
    }

    /// Observe section changes (latest value only)
    pub fn subscribe(&self) -> watch::Receiver<Section> {
        self.inner.subscribe()
    }
}
