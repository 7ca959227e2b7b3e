//! Persistence for the user credential.
//!
//! A single JSON record lives at the configured token path:
//!
//! ```json
//! {"access_token": "...", "expires_in": 14400, "created_at": "2024-05-01T12:00:00Z"}
//! ```
//!
//! The record is written to a sibling temporary file with mode 0600 and
//! renamed into place, so readers never observe a partially written file.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while loading or saving the credential.
#[derive(Error, Debug)]
pub enum TokenStoreError {
    /// No usable credential is stored (absent, unreadable, malformed or empty).
    #[error("no stored credential")]
    NotFound,

    /// A credential is stored but its lifetime has elapsed.
    #[error("stored credential expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },

    /// Writing or removing the record failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The credential could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// An access token with its lifetime.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    /// Lifetime in seconds, as reported by the token endpoint.
    pub expires_in: u64,
    /// When the token was issued.
    #[serde(rename = "created_at")]
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

impl Credential {
    /// Creates a credential issued at `issued_at`.
    pub fn new(access_token: impl Into<String>, expires_in: u64, issued_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
            issued_at,
        }
    }

    /// The instant the credential stops being valid.
    ///
    /// Returns `None` if the lifetime overflows the calendar, which is treated
    /// as never expiring.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let lifetime = i64::try_from(self.expires_in).ok()?;
        let lifetime = TimeDelta::try_seconds(lifetime)?;
        self.issued_at.checked_add_signed(lifetime)
    }

    /// Whether the credential is still valid at `now` (expiry is exclusive).
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }

    /// Whether the credential is valid right now.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// File-backed store for the user credential.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Creates a store for the record at `path`. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the stored record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the credential and checks it against the current time.
    ///
    /// # Errors
    ///
    /// See [`TokenStore::load_at`].
    pub fn load(&self) -> Result<Credential, TokenStoreError> {
        self.load_at(Utc::now())
    }

    /// Loads the credential and checks it against `now`.
    ///
    /// # Errors
    ///
    /// - [`TokenStoreError::NotFound`] if the file is absent, unreadable,
    ///   malformed, or holds an empty token
    /// - [`TokenStoreError::Expired`] if `created_at + expires_in <= now`
    pub fn load_at(&self, now: DateTime<Utc>) -> Result<Credential, TokenStoreError> {
        let credential = self.read().ok_or(TokenStoreError::NotFound)?;

        match credential.expires_at() {
            Some(expired_at) if expired_at <= now => Err(TokenStoreError::Expired { expired_at }),
            _ => Ok(credential),
        }
    }

    /// Reads the record without checking expiry.
    ///
    /// Returns `None` for anything [`TokenStore::load_at`] reports as `NotFound`.
    #[must_use]
    pub fn peek(&self) -> Option<Credential> {
        self.read()
    }

    /// Whether the stored record is exactly `credential`.
    #[must_use]
    pub fn holds(&self, credential: &Credential) -> bool {
        self.read().as_ref() == Some(credential)
    }

    fn read(&self) -> Option<Credential> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Token file not readable");
                return None;
            }
        };

        match serde_json::from_str::<Credential>(&data) {
            Ok(credential) if !credential.access_token.is_empty() => Some(credential),
            Ok(_) => {
                debug!(path = %self.path.display(), "Token file holds an empty token");
                None
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Token file is malformed");
                None
            }
        }
    }

    /// Persists `credential`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns [`TokenStoreError::Io`] if the directory, temporary file or
    /// rename fails.
    pub fn save(&self, credential: &Credential) -> Result<(), TokenStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let body = serde_json::to_vec(credential)?;
        let tmp_path = self.tmp_path();

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp_path)?;

        // The mode above only applies on creation; a leftover tmp file keeps its own.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        debug!(path = %self.path.display(), "Saved credential");
        Ok(())
    }

    /// Removes the stored record.
    ///
    /// Returns `true` if a record was removed and `false` if none existed.
    ///
    /// # Errors
    ///
    /// Returns [`TokenStoreError::Io`] if the file exists but cannot be removed.
    pub fn clear(&self) -> Result<bool, TokenStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "token.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> TokenStore {
        TokenStore::new(dir.path().join("token.json"))
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = store_in(&dir).load();
        assert!(matches!(result, Err(TokenStoreError::NotFound)));
    }

    #[test]
    fn test_malformed_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{not json").unwrap();

        assert!(matches!(store.load(), Err(TokenStoreError::NotFound)));
    }

    #[test]
    fn test_empty_token_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"access_token":"","expires_in":3600,"created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(matches!(store.load(), Err(TokenStoreError::NotFound)));
    }

    #[test]
    fn test_expired_two_hours_after_one_hour_token() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let now = Utc::now();
        let credential = Credential::new("tok", 3600, now - TimeDelta::seconds(7200));
        store.save(&credential).unwrap();

        match store.load_at(now) {
            Err(TokenStoreError::Expired { expired_at }) => {
                assert_eq!(expired_at, now - TimeDelta::seconds(3600));
            }
            other => panic!("expected Expired, got {other:?}"),
        }
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let issued = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        store.save(&Credential::new("tok", 60, issued)).unwrap();

        let at_expiry = issued + TimeDelta::seconds(60);
        assert!(matches!(
            store.load_at(at_expiry),
            Err(TokenStoreError::Expired { .. })
        ));

        let just_before = at_expiry - TimeDelta::milliseconds(1);
        assert_eq!(store.load_at(just_before).unwrap().access_token, "tok");
    }

    #[test]
    fn test_save_then_load_valid() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let credential = Credential::new("user-token", 14400, Utc::now());
        store.save(&credential).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, credential);
        assert!(loaded.is_valid());
    }

    #[test]
    fn test_file_format_uses_created_at() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .save(&Credential::new("abc", 14400, Utc::now()))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["access_token"], "abc");
        assert_eq!(raw["expires_in"], 14400);
        assert!(raw["created_at"].is_string());
        assert!(raw.get("issued_at").is_none());
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("nested/deeper/token.json"));
        store.save(&Credential::new("tok", 10, Utc::now())).unwrap();
        assert!(store.path().exists());
        assert!(!dir.path().join("nested/deeper/token.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&Credential::new("tok", 10, Utc::now())).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_save_replaces_previous_record() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save(&Credential::new("first", 10, Utc::now())).unwrap();
        store.save(&Credential::new("second", 10, Utc::now())).unwrap();

        assert_eq!(store.load().unwrap().access_token, "second");
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(!store.clear().unwrap());

        store.save(&Credential::new("tok", 10, Utc::now())).unwrap();
        assert!(store.clear().unwrap());
        assert!(matches!(store.load(), Err(TokenStoreError::NotFound)));
    }

    #[test]
    fn test_holds_distinguishes_stale_record() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let stale = Credential::new("old", 3600, Utc::now() - TimeDelta::hours(1));
        let fresh = Credential::new("new", 3600, Utc::now());

        assert!(!store.holds(&fresh));
        store.save(&stale).unwrap();
        assert!(!store.holds(&fresh));
        store.save(&fresh).unwrap();
        assert!(store.holds(&fresh));
    }

    #[test]
    fn test_peek_ignores_expiry() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let old = Utc::now() - TimeDelta::days(30);
        store.save(&Credential::new("stale", 60, old)).unwrap();

        assert!(store.peek().is_some());
        assert!(!store.peek().unwrap().is_valid());
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential::new("secret-token", 10, Utc::now());
        assert!(!format!("{credential:?}").contains("secret-token"));
    }
}
