//! Persisted credentials
//!
//! Plain entries (`udi`, `rtmpUrl`, `election`) live in one namespace; the
//! `keyenc` decryption key lives in a separate, encrypted one. Missing entries
//! read as the empty string.
//!
//! Layout of `FileCredentialStore`:
//! - `prefs.toml`   plain entries
//! - `secure.toml`  sealed entries (base64 of `nonce || ciphertext+tag`)
//! - `master.key`   base64 256-bit key sealing `secure.toml`, created on first use

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::codec::{self, KEY_LEN};

const PREFS_FILE: &str = "prefs.toml";
const SECURE_FILE: &str = "secure.toml";
const MASTER_KEY_FILE: &str = "master.key";
const KEYENC: &str = "app_keyenc";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to access credential storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse credential file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize credentials: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Master key is corrupt")]
    CorruptMasterKey,

    #[error("Encrypted entry could not be opened")]
    Sealed,
}

/// Keys of the plain namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    Udi,
    RtmpUrl,
    Election,
}

impl CredentialKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::Udi => "udi",
            CredentialKey::RtmpUrl => "rtmpUrl",
            CredentialKey::Election => "election",
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key-value credential persistence.
///
/// Implementations serialize their own writes; callers add no locking.
pub trait CredentialStore: Send + Sync {
    /// Value for `key`, or the empty string
    fn get(&self, key: CredentialKey) -> String;

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), CredentialError>;

    /// Stored base64 decryption key, if any
    fn get_keyenc(&self) -> Option<String>;

    fn store_keyenc(&self, keyenc: &str) -> Result<(), CredentialError>;
}

/// Process-local store, for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    plain: Mutex<HashMap<CredentialKey, String>>,
    keyenc: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: CredentialKey) -> String {
        self.plain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), CredentialError> {
        self.plain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.to_string());
        Ok(())
    }

    fn get_keyenc(&self) -> Option<String> {
        self.keyenc.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn store_keyenc(&self, keyenc: &str) -> Result<(), CredentialError> {
        *self.keyenc.lock().unwrap_or_else(PoisonError::into_inner) = Some(keyenc.to_string());
        Ok(())
    }
}

/// Store backed by files in one directory
#[derive(Debug)]
pub struct FileCredentialStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Open (or lazily create) a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_table(&self, file: &str) -> Result<BTreeMap<String, String>, CredentialError> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    fn write_table(&self, file: &str, table: &BTreeMap<String, String>) -> Result<(), CredentialError> {
        std::fs::create_dir_all(&self.dir)?;
        let content = toml::to_string_pretty(table)?;

        write_private(&self.dir, file, &content)?;
        Ok(())
    }

    fn master_key(&self) -> Result<[u8; KEY_LEN], CredentialError> {
        let path = self.dir.join(MASTER_KEY_FILE);
        if path.exists() {
            let encoded = std::fs::read_to_string(&path)?;
            return codec::decode_key(&encoded).ok_or(CredentialError::CorruptMasterKey);
        }

        std::fs::create_dir_all(&self.dir)?;
        let key = codec::generate_key();
        write_private(&self.dir, MASTER_KEY_FILE, &codec::encode_key(&key))?;
        tracing::info!("Created credential master key at {}", path.display());
        Ok(key)
    }

    fn try_get_keyenc(&self) -> Result<Option<String>, CredentialError> {
        let table = self.read_table(SECURE_FILE)?;
        let Some(sealed) = table.get(KEYENC) else {
            return Ok(None);
        };

        let key = self.master_key()?;
        let data = STANDARD.decode(sealed).map_err(|_| CredentialError::Sealed)?;
        let plain = codec::open(&data, &key).map_err(|_| CredentialError::Sealed)?;
        String::from_utf8(plain).map(Some).map_err(|_| CredentialError::Sealed)
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: CredentialKey) -> String {
        match self.read_table(PREFS_FILE) {
            Ok(table) => table.get(key.as_str()).cloned().unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Failed to read credential {}: {}", key, e);
                String::new()
            }
        }
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), CredentialError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = self.read_table(PREFS_FILE)?;
        table.insert(key.as_str().to_string(), value.to_string());
        self.write_table(PREFS_FILE, &table)
    }

    fn get_keyenc(&self) -> Option<String> {
        self.try_get_keyenc().unwrap_or_else(|e| {
            tracing::warn!("Failed to read keyenc: {}", e);
            None
        })
    }

    fn store_keyenc(&self, keyenc: &str) -> Result<(), CredentialError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let key = self.master_key()?;
        let sealed = codec::seal(keyenc.as_bytes(), &key).map_err(|_| CredentialError::Sealed)?;

        let mut table = self.read_table(SECURE_FILE)?;
        table.insert(KEYENC.to_string(), STANDARD.encode(sealed));
        self.write_table(SECURE_FILE, &table)
    }
}

/// Write `dir/file` through a temp file that is owner-only from creation,
/// then rename it into place. Readers never see a partial file.
fn write_private(dir: &Path, file: &str, content: &str) -> std::io::Result<()> {
    use std::io::Write;

    let tmp = dir.join(format!("{file}.tmp"));
    match std::fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut out = options.open(&tmp)?;
    out.write_all(content.as_bytes())?;
    out.sync_all()?;
    drop(out);

    std::fs::rename(&tmp, dir.join(file))
}
