//! Ordered credential file manager
//!
//! The store file is a JSON array of account seeds. All writes use atomic
//! temp-file + rename to prevent corruption on crash, and a tokio Mutex
//! serializes concurrent writers (admin add/remove racing each other). Reads
//! clone the in-memory list under the lock, so selection-time lookups never
//! observe a half-applied update.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One account's opaque session token pair.
///
/// Both tokens are required non-empty. They are forwarded to the upstream as
/// cookies and never appear in logs or API responses except as the masked
/// suffix produced by [`SessionCredential::masked_suffix`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredential {
    /// Primary session token (the authenticated-session cookie value)
    pub session_token: String,
    /// Secondary CSRF token paired with the session
    pub csrf_token: String,
}

impl SessionCredential {
    /// Last four characters of the session token, prefixed with an ellipsis,
    /// for admin listings. Tokens of four characters or fewer render as
    /// `"****"` so the full value is never reconstructable.
    pub fn masked_suffix(&self) -> String {
        let chars: Vec<char> = self.session_token.chars().collect();
        if chars.len() <= 4 {
            return "****".to_string();
        }
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("...{suffix}")
    }
}

/// A configured account: stable id plus its credential pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSeed {
    pub id: String,
    #[serde(flatten)]
    pub credential: SessionCredential,
}

/// Thread-safe ordered credential file manager.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<Vec<AccountSeed>>,
}

impl CredentialStore {
    /// Load the seed list from the given file path.
    ///
    /// Fails with `Error::Config` when the file is absent or malformed, or
    /// when any seed has a duplicate id or an empty field. Membership is
    /// configuration; a service with a broken account record must not start.
    pub async fn load(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "credential file not found: {}",
                path.display()
            )));
        }
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
        let seeds: Vec<AccountSeed> = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("parsing credential file: {e}")))?;

        for (i, seed) in seeds.iter().enumerate() {
            validate_seed(seed)?;
            if seeds[..i].iter().any(|s| s.id == seed.id) {
                return Err(Error::Config(format!("duplicate account id: {}", seed.id)));
            }
        }

        info!(path = %path.display(), accounts = seeds.len(), "loaded credentials");
        Ok(Self {
            path,
            state: Mutex::new(seeds),
        })
    }

    /// Get a clone of a specific account's credential.
    pub async fn get(&self, account_id: &str) -> Option<SessionCredential> {
        let state = self.state.lock().await;
        state
            .iter()
            .find(|s| s.id == account_id)
            .map(|s| s.credential.clone())
    }

    /// All seeds in configuration order.
    pub async fn seeds(&self) -> Vec<AccountSeed> {
        self.state.lock().await.clone()
    }

    /// All account ids in configuration order.
    pub async fn ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.iter().map(|s| s.id.clone()).collect()
    }

    /// Append a new seed and persist to disk.
    ///
    /// Rejects empty fields and duplicate ids with `Error::Config`; on
    /// rejection the store (memory and file) is unchanged.
    pub async fn add(&self, seed: AccountSeed) -> Result<()> {
        validate_seed(&seed)?;
        let mut state = self.state.lock().await;
        if state.iter().any(|s| s.id == seed.id) {
            return Err(Error::Config(format!("duplicate account id: {}", seed.id)));
        }
        debug!(account_id = seed.id, "adding credential");
        state.push(seed);
        write_atomic(&self.path, &state).await
    }

    /// Remove a seed by id and persist to disk.
    ///
    /// Idempotent: removing an absent id succeeds without touching the file.
    /// Returns whether anything was removed.
    pub async fn remove(&self, account_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.len();
        state.retain(|s| s.id != account_id);
        if state.len() == before {
            return Ok(false);
        }
        debug!(account_id, "removed credential");
        write_atomic(&self.path, &state).await?;
        Ok(true)
    }

    /// Number of stored seeds.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Reject seeds with an empty id or an empty token field.
fn validate_seed(seed: &AccountSeed) -> Result<()> {
    if seed.id.trim().is_empty() {
        return Err(Error::Config("account id must be non-empty".into()));
    }
    if seed.credential.session_token.is_empty() {
        return Err(Error::Config(format!(
            "account {}: session_token must be non-empty",
            seed.id
        )));
    }
    if seed.credential.csrf_token.is_empty() {
        return Err(Error::Config(format!(
            "account {}: csrf_token must be non-empty",
            seed.id
        )));
    }
    Ok(())
}

/// Write the seed list to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains live session tokens.
async fn write_atomic(path: &Path, seeds: &[AccountSeed]) -> Result<()> {
    let json = serde_json::to_string_pretty(seeds)
        .map_err(|e| Error::Io(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(id: &str) -> AccountSeed {
        AccountSeed {
            id: id.to_string(),
            credential: SessionCredential {
                session_token: format!("sess_{id}"),
                csrf_token: format!("csrf_{id}"),
            },
        }
    }

    async fn store_with(dir: &tempfile::TempDir, seeds: &[AccountSeed]) -> CredentialStore {
        let path = dir.path().join("accounts.json");
        let json = serde_json::to_string_pretty(seeds).unwrap();
        tokio::fs::write(&path, json).await.unwrap();
        CredentialStore::load(path).await.unwrap()
    }

    #[tokio::test]
    async fn load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CredentialStore::load(dir.path().join("nope.json")).await;
        match result {
            Err(Error::Config(msg)) => assert!(msg.contains("not found"), "got: {msg}"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_malformed_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        tokio::fs::write(&path, "{{ not json").await.unwrap();
        assert!(matches!(
            CredentialStore::load(path).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn load_duplicate_id_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let json = serde_json::to_string(&vec![seed("a"), seed("a")]).unwrap();
        tokio::fs::write(&path, json).await.unwrap();
        match CredentialStore::load(path).await {
            Err(Error::Config(msg)) => assert!(msg.contains("duplicate"), "got: {msg}"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_empty_token_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let mut bad = seed("a");
        bad.credential.csrf_token.clear();
        let json = serde_json::to_string(&vec![bad]).unwrap();
        tokio::fs::write(&path, json).await.unwrap();
        match CredentialStore::load(path).await {
            Err(Error::Config(msg)) => assert!(msg.contains("csrf_token"), "got: {msg}"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[seed("beta"), seed("alpha"), seed("gamma")]).await;
        store.add(seed("delta")).await.unwrap();

        // Reload from disk into a fresh store
        let store2 = CredentialStore::load(dir.path().join("accounts.json"))
            .await
            .unwrap();
        assert_eq!(store2.ids().await, vec!["beta", "alpha", "gamma", "delta"]);
    }

    #[tokio::test]
    async fn get_returns_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[seed("acct-1")]).await;
        let cred = store.get("acct-1").await.unwrap();
        assert_eq!(cred.session_token, "sess_acct-1");
        assert_eq!(cred.csrf_token, "csrf_acct-1");
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn add_duplicate_rejected_and_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[seed("a")]).await;

        let mut dup = seed("a");
        dup.credential.session_token = "other".into();
        assert!(matches!(store.add(dup).await, Err(Error::Config(_))));

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("a").await.unwrap().session_token, "sess_a");
    }

    #[tokio::test]
    async fn add_empty_session_token_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[]).await;
        let mut bad = seed("a");
        bad.credential.session_token.clear();
        assert!(matches!(store.add(bad).await, Err(Error::Config(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[seed("a"), seed("b")]).await;

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
        assert_eq!(store.ids().await, vec!["b"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[]).await;
        store.add(seed("a")).await.unwrap();

        let metadata = tokio::fs::metadata(dir.path().join("accounts.json"))
            .await
            .unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_adds_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store_with(&dir, &[]).await);

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add(seed(&format!("acct-{i}"))).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len().await, 10);
        let contents = tokio::fs::read_to_string(dir.path().join("accounts.json"))
            .await
            .unwrap();
        let parsed: Vec<AccountSeed> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }

    #[test]
    fn masked_suffix_shows_only_tail() {
        let cred = SessionCredential {
            session_token: "eyJhbGciOiJkaXIifQ.token-value-9f3c".into(),
            csrf_token: "csrf".into(),
        };
        assert_eq!(cred.masked_suffix(), "...9f3c");
    }

    #[test]
    fn masked_suffix_short_token_fully_masked() {
        let cred = SessionCredential {
            session_token: "abcd".into(),
            csrf_token: "csrf".into(),
        };
        assert_eq!(cred.masked_suffix(), "****");
    }
}
