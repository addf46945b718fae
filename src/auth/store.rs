/// Persisted credential slots
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const TOKEN_EXPIRES_KEY: &str = "token_expires";
pub const PENDING_AUTHORIZATION_KEY: &str = "pending_authorization";

const ALL_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    TOKEN_EXPIRES_KEY,
    PENDING_AUTHORIZATION_KEY,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store contents are corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    Poisoned,
}

/// String key/value persistence backing the session
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store; contents vanish with the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let slots = self.slots.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(slots.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().map_err(|_| StoreError::Poisoned)?;
        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().map_err(|_| StoreError::Poisoned)?;
        slots.remove(key);
        Ok(())
    }
}

/// JSON map on disk, readable only by the owner
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<HashMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), StoreError> {
        if map.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(map)?;
        fs::write(&self.path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// Access/refresh token pair with its absolute expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at_epoch_ms: i64,
}

impl Credential {
    /// Build from a token endpoint answer received at `now_ms`
    pub fn from_expires_in(
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: u64,
        now_ms: i64,
    ) -> Self {
        let lifetime_ms = i64::try_from(expires_in_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        Self {
            access_token,
            refresh_token,
            expires_at_epoch_ms: now_ms.saturating_add(lifetime_ms),
        }
    }

    /// True once `now_ms` has entered the skew window before expiry
    pub fn needs_refresh(&self, now_ms: i64, skew_ms: i64) -> bool {
        now_ms >= self.expires_at_epoch_ms.saturating_sub(skew_ms)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_epoch_ms
    }
}

/// PKCE secret and CSRF nonce kept between redirect and callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub code_verifier: String,
    pub state: String,
}

/// Typed view over the four persisted slots
pub struct CredentialStore {
    inner: Box<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(inner: Box<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    /// Load the credential; a partial or unparseable set of slots counts as absent
    pub fn load_credential(&self) -> Result<Option<Credential>, StoreError> {
        let access_token = self.inner.get(ACCESS_TOKEN_KEY)?;
        let expires = self.inner.get(TOKEN_EXPIRES_KEY)?;

        let (access_token, expires) = match (access_token, expires) {
            (Some(token), Some(expires)) if !token.is_empty() => (token, expires),
            _ => return Ok(None),
        };

        let expires_at_epoch_ms = match expires.trim().parse::<i64>() {
            Ok(ms) => ms,
            Err(_) => {
                tracing::warn!("Stored token expiry is not a number; treating session as absent");
                return Ok(None);
            }
        };

        let refresh_token = self
            .inner
            .get(REFRESH_TOKEN_KEY)?
            .filter(|token| !token.is_empty());

        Ok(Some(Credential {
            access_token,
            refresh_token,
            expires_at_epoch_ms,
        }))
    }

    pub fn save_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        self.inner.set(ACCESS_TOKEN_KEY, &credential.access_token)?;
        match credential.refresh_token {
            Some(ref refresh) => self.inner.set(REFRESH_TOKEN_KEY, refresh)?,
            None => self.inner.remove(REFRESH_TOKEN_KEY)?,
        }
        self.inner
            .set(TOKEN_EXPIRES_KEY, &credential.expires_at_epoch_ms.to_string())
    }

    pub fn clear_credential(&self) -> Result<(), StoreError> {
        self.inner.remove(ACCESS_TOKEN_KEY)?;
        self.inner.remove(REFRESH_TOKEN_KEY)?;
        self.inner.remove(TOKEN_EXPIRES_KEY)
    }

    pub fn load_pending(&self) -> Result<Option<PendingAuthorization>, StoreError> {
        match self.inner.get(PENDING_AUTHORIZATION_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(pending) => Ok(Some(pending)),
                Err(e) => {
                    tracing::warn!("Discarding unreadable pending authorization: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn save_pending(&self, pending: &PendingAuthorization) -> Result<(), StoreError> {
        let raw = serde_json::to_string(pending)?;
        self.inner.set(PENDING_AUTHORIZATION_KEY, &raw)
    }

    pub fn clear_pending(&self) -> Result<(), StoreError> {
        self.inner.remove(PENDING_AUTHORIZATION_KEY)
    }

    /// Remove every slot
    pub fn clear_all(&self) -> Result<(), StoreError> {
        for key in ALL_KEYS {
            self.inner.remove(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credential() -> Credential {
        Credential {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at_epoch_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_needs_refresh_inside_skew_window() {
        let credential = Credential::from_expires_in("a".into(), None, 3600, 0);
        assert_eq!(credential.expires_at_epoch_ms, 3_600_000);
        assert!(!credential.needs_refresh(3_539_999, 60_000));
        assert!(credential.needs_refresh(3_540_000, 60_000));
        assert!(!credential.is_expired(3_599_999));
        assert!(credential.is_expired(3_600_000));
    }

    #[test]
    fn test_credential_slots_round_trip_and_clear() {
        let store = CredentialStore::in_memory();
        assert!(store.load_credential().unwrap().is_none());

        store.save_credential(&sample_credential()).unwrap();
        assert_eq!(store.load_credential().unwrap(), Some(sample_credential()));

        store.clear_credential().unwrap();
        assert!(store.load_credential().unwrap().is_none());
    }

    #[test]
    fn test_missing_refresh_token_slot_is_removed() {
        let store = CredentialStore::in_memory();
        store.save_credential(&sample_credential()).unwrap();

        let mut without_refresh = sample_credential();
        without_refresh.refresh_token = None;
        store.save_credential(&without_refresh).unwrap();

        assert_eq!(store.load_credential().unwrap().unwrap().refresh_token, None);
    }

    #[test]
    fn test_garbled_expiry_reads_as_absent() {
        let kv = MemoryStore::new();
        kv.set(ACCESS_TOKEN_KEY, "a").unwrap();
        kv.set(TOKEN_EXPIRES_KEY, "soon").unwrap();
        let store = CredentialStore::new(Box::new(kv));
        assert!(store.load_credential().unwrap().is_none());
    }

    #[test]
    fn test_clear_all_leaves_nothing() {
        let store = CredentialStore::in_memory();
        store.save_credential(&sample_credential()).unwrap();
        store
            .save_pending(&PendingAuthorization {
                code_verifier: "v".into(),
                state: "s".into(),
            })
            .unwrap();

        store.clear_all().unwrap();
        assert!(store.load_credential().unwrap().is_none());
        assert!(store.load_pending().unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        {
            let store = CredentialStore::new(Box::new(FileStore::new(path.clone())));
            store.save_credential(&sample_credential()).unwrap();
        }

        let reopened = CredentialStore::new(Box::new(FileStore::new(path.clone())));
        assert_eq!(reopened.load_credential().unwrap(), Some(sample_credential()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        reopened.clear_all().unwrap();
        assert!(!path.exists());
    }
}
