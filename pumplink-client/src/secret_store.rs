//! Credential storage.
//!
//! The platform keychain sits behind [`SecretStore`]; the client only ever
//! reads, writes and deletes the access and refresh credentials by key.

use std::{
    collections::BTreeMap,
    fs, io,
    future::Future,
    path::{Path, PathBuf},
    sync::Mutex,
};

use pumplink_core::{ACCESS_CREDENTIAL_KEY, REFRESH_CREDENTIAL_KEY};
use thiserror::Error;

/// Upper bound for the secrets file; it holds two short tokens.
pub const MAX_SECRETS_BYTES: u64 = 16 * 1024;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret store io failed: {0}")]
    Io(#[from] io::Error),
    #[error("secrets file is corrupt: {0}")]
    Corrupt(String),
    #[error("secrets file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("secret store lock poisoned")]
    Poisoned,
}

pub trait SecretStore: Send + Sync + 'static {
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, SecretStoreError>> + Send;

    fn set(&self, key: &str, value: &str)
    -> impl Future<Output = Result<(), SecretStoreError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), SecretStoreError>> + Send;
}

/// Removes both credentials. Both deletions are attempted even if the first fails.
pub async fn purge_credentials<S: SecretStore>(store: &S) -> Result<(), SecretStoreError> {
    let access = store.delete(ACCESS_CREDENTIAL_KEY).await;
    let refresh = store.delete(REFRESH_CREDENTIAL_KEY).await;
    access.and(refresh)
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(access: &str, refresh: &str) -> Self {
        let store = Self::new();
        if let Ok(mut entries) = store.entries.lock() {
            entries.insert(ACCESS_CREDENTIAL_KEY.to_owned(), access.to_owned());
            entries.insert(REFRESH_CREDENTIAL_KEY.to_owned(), refresh.to_owned());
        }
        store
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }
}

impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SecretStoreError> {
        let entries = self.entries.lock().map_err(|_| SecretStoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SecretStoreError> {
        let mut entries = self.entries.lock().map_err(|_| SecretStoreError::Poisoned)?;
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        let mut entries = self.entries.lock().map_err(|_| SecretStoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// JSON map on disk, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileSecretStore {
    path: PathBuf,
    // Serialises read-modify-write cycles within this process.
    guard: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, SecretStoreError> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        if meta.len() > MAX_SECRETS_BYTES {
            return Err(SecretStoreError::TooLarge {
                size: meta.len(),
                max: MAX_SECRETS_BYTES,
            });
        }

        let data = fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(|err| SecretStoreError::Corrupt(err.to_string()))
    }

    fn store(&self, entries: &BTreeMap<String, String>) -> Result<(), SecretStoreError> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(entries)
            .map_err(|err| SecretStoreError::Corrupt(err.to_string()))?;
        fs::write(&tmp, payload.as_bytes())?;
        restrict_permissions(&tmp)?;

        // rename replaces atomically on unix; Windows refuses an existing target.
        #[cfg(windows)]
        if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), SecretStoreError> {
        let _guard = self.guard.lock().map_err(|_| SecretStoreError::Poisoned)?;
        let mut entries = self.load()?;
        apply(&mut entries);
        self.store(&entries)
    }
}

impl SecretStore for FileSecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SecretStoreError> {
        let _guard = self.guard.lock().map_err(|_| SecretStoreError::Poisoned)?;
        Ok(self.load()?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SecretStoreError> {
        self.update(|entries| {
            entries.insert(key.to_owned(), value.to_owned());
        })
    }

    async fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}
