//! Trust Store
//!
//! Persistent set of accepted client key fingerprints, one per line in a
//! plain text file (`#` lines are comments). Loaded once at startup;
//! accepted fingerprints are appended immediately so a crash never loses
//! an approval. Reads take no lock beyond an RwLock read guard; writes are
//! exclusive and also hit the file.
//!
//! Fingerprints are SHA-256 over the public key, in the usual
//! `SHA256:base64` rendering, so they can be compared against
//! `ssh-keygen -lf` output.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

/// How unknown fingerprints are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Unknown keys may be accepted without an operator when no
    /// interactive approver is available (first-use trust).
    Open,
    /// Unknown keys require prior presence in the store or an explicit
    /// interactive approval. Never accepted implicitly.
    Strict,
}

impl TrustPolicy {
    /// Parse the configuration string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

/// File-backed fingerprint whitelist.
pub struct TrustStore {
    path: PathBuf,
    policy: TrustPolicy,
    fingerprints: RwLock<HashSet<String>>,
}

impl TrustStore {
    /// Load the store; a missing file is an empty store.
    pub fn load(path: &Path, policy: TrustPolicy) -> std::io::Result<Self> {
        let mut fingerprints = HashSet::new();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    fingerprints.insert(line.to_string());
                }
                debug!(
                    path = %path.display(),
                    count = fingerprints.len(),
                    "trust store loaded"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no trust store yet");
            }
            Err(e) => return Err(e),
        }
        Ok(Self {
            path: path.to_path_buf(),
            policy,
            fingerprints: RwLock::new(fingerprints),
        })
    }

    /// The configured policy.
    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// Whether a fingerprint is already accepted.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.fingerprints
            .read()
            .expect("trust store poisoned")
            .contains(fingerprint)
    }

    /// Accept a fingerprint: record it in memory and append it to the
    /// file (created with mode 0600 if needed).
    pub fn insert(&self, fingerprint: &str) -> std::io::Result<()> {
        {
            let mut set = self.fingerprints.write().expect("trust store poisoned");
            if !set.insert(fingerprint.to_string()) {
                return Ok(());
            }
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        restrict_mode(&file)?;
        writeln!(file, "{fingerprint}")?;
        info!(fingerprint, "fingerprint added to trust store");
        Ok(())
    }

    /// Number of accepted fingerprints.
    pub fn len(&self) -> usize {
        self.fingerprints
            .read()
            .expect("trust store poisoned")
            .len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn restrict_mode(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = file.metadata()?.permissions();
    permissions.set_mode(0o600);
    file.set_permissions(permissions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            TrustStore::load(&dir.path().join("known_clients"), TrustPolicy::Open).unwrap();
        assert!(store.is_empty());
        assert!(!store.contains("SHA256:abc"));
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_clients");
        std::fs::write(
            &path,
            "# clients approved on desk\n\nSHA256:aaaa\n  SHA256:bbbb  \n",
        )
        .unwrap();
        let store = TrustStore::load(&path, TrustPolicy::Strict).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains("SHA256:aaaa"));
        assert!(store.contains("SHA256:bbbb"));
    }

    #[test]
    fn insert_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_clients");
        let store = TrustStore::load(&path, TrustPolicy::Open).unwrap();
        store.insert("SHA256:cccc").unwrap();
        store.insert("SHA256:cccc").unwrap(); // idempotent

        let reloaded = TrustStore::load(&path, TrustPolicy::Open).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains("SHA256:cccc"));
    }

    #[test]
    fn store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_clients");
        let store = TrustStore::load(&path, TrustPolicy::Open).unwrap();
        store.insert("SHA256:dddd").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
