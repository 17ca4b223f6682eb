//! Host key verification against an OpenSSH `known_hosts` file.
//!
//! The store is append-only: new keys are trusted on first use and written
//! to the end of the file, and a changed key is refused outright, never
//! overwritten.

use std::{
    collections::HashMap, fs, io::Write, path::{Path, PathBuf}, sync::{Arc, Mutex}
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use russh::keys::{HashAlg, PublicKey, PublicKeyBase64};
use tracing::{debug, info, warn};

use crate::{
    endpoint::DEFAULT_SSH_PORT, error::{TunnelError, TunnelResult}
};

/// Outcome of checking a presented host key against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Key matches the recorded entry
    Verified,
    /// Host has no recorded key of this type
    Unknown,
    /// Host is recorded with a different key
    Mismatch { expected: String },
}

#[derive(Clone)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// File-backed known-hosts store.
pub struct KnownHostsStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Vec<HostKeyEntry>>>,
}

impl KnownHostsStore {
    /// Open the store, creating an empty `0600` file when none exists.
    pub fn open(path: impl Into<PathBuf>) -> TunnelResult<Self> {
        let path = path.into();
        if !path.exists() {
            create_empty(&path)?;
        }
        let entries = load_entries(&path)?;
        debug!(path = %path.display(), hosts = entries.len(), "known_hosts loaded");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Check a presented key for `host:port`.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Verification {
        let lookup = lookup_key(host, port);
        let key_type = key.algorithm().to_string();
        let key_data = BASE64.encode(key.public_key_bytes());

        let entries = self.entries.lock().expect("known_hosts lock");
        let recorded = entries
            .get(&lookup)
            .or_else(|| entries.get(&host.to_lowercase()));
        if let Some(recorded) = recorded {
            for entry in recorded {
                if entry.key_type != key_type {
                    continue;
                }
                if entry.key_data == key_data {
                    return Verification::Verified;
                }
                return Verification::Mismatch {
                    expected: fingerprint_of_b64(&entry.key_data),
                };
            }
        }
        Verification::Unknown
    }

    /// Append a newly trusted key. The file is never rewritten.
    pub fn append(&self, host: &str, port: u16, key: &PublicKey) -> TunnelResult<()> {
        let lookup = lookup_key(host, port);
        let key_type = key.algorithm().to_string();
        let key_data = BASE64.encode(key.public_key_bytes());

        let mut entries = self.entries.lock().expect("known_hosts lock");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(TunnelError::Io)?;
        writeln!(file, "{lookup} {key_type} {key_data}").map_err(TunnelError::Io)?;
        entries
            .entry(lookup)
            .or_default()
            .push(HostKeyEntry { key_type, key_data });
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lookup_key(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == DEFAULT_SSH_PORT {
        host
    } else {
        format!("[{host}]:{port}")
    }
}

fn fingerprint_of_b64(key_data: &str) -> String {
    russh::keys::parse_public_key_base64(key_data)
        .map(|key| key.fingerprint(HashAlg::Sha256).to_string())
        .unwrap_or_else(|_| "<unparseable entry>".to_string())
}

fn load_entries(path: &Path) -> TunnelResult<HashMap<String, Vec<HostKeyEntry>>> {
    let mut entries: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();
    let data = fs::read_to_string(path).map_err(TunnelError::Io)?;
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(hosts), Some(key_type), Some(key_data)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        for host in hosts.split(',') {
            // hashed hostnames are opaque; skip them
            if host.starts_with('|') {
                continue;
            }
            entries
                .entry(host.to_lowercase())
                .or_default()
                .push(HostKeyEntry {
                    key_type: key_type.to_string(),
                    key_data: key_data.to_string(),
                });
        }
    }
    Ok(entries)
}

fn create_empty(path: &Path) -> TunnelResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(TunnelError::Io)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(TunnelError::Io)?;
    Ok(())
}

/// How the connection manager treats server host keys.
#[derive(Clone)]
pub enum HostKeyPolicy {
    /// Accept anything. For explicitly insecure deployments only.
    Insecure,
    /// Verify against the known-hosts store; unknown keys are trusted on
    /// first use and appended unless `record` is false (grab mode).
    Strict {
        store: Arc<KnownHostsStore>,
        record: bool,
    },
}

impl HostKeyPolicy {
    /// Apply the policy to a presented key. `Ok(true)` accepts the key.
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> TunnelResult<bool> {
        match self {
            HostKeyPolicy::Insecure => Ok(true),
            HostKeyPolicy::Strict { store, record } => {
                let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
                match store.verify(host, port, key) {
                    Verification::Verified => {
                        debug!(host, port, "host key verified");
                        Ok(true)
                    }
                    Verification::Mismatch { expected } => {
                        warn!(
                            host,
                            port,
                            expected,
                            presented = %fingerprint,
                            "HOST KEY CHANGED: possible man-in-the-middle, refusing"
                        );
                        Err(TunnelError::HostKeyMismatch {
                            host: format!("{host}:{port}"),
                            expected,
                            actual: fingerprint,
                        })
                    }
                    Verification::Unknown if *record => {
                        warn!(
                            host,
                            port,
                            fingerprint = %fingerprint,
                            file = %store.path().display(),
                            "host not yet trusted, recording key (trust on first use)"
                        );
                        store.append(host, port, key)?;
                        Ok(true)
                    }
                    Verification::Unknown => {
                        info!(host, port, fingerprint = %fingerprint, "accepting host key without recording it");
                        Ok(true)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::{
        PrivateKey, ssh_key::{Algorithm, rand_core::OsRng}
    };

    fn sample_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    fn store_in(dir: &tempfile::TempDir) -> KnownHostsStore {
        KnownHostsStore::open(dir.path().join("known_hosts")).unwrap()
    }

    #[test]
    fn missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.path().exists());
    }

    #[test]
    fn unknown_then_verified_after_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let key = sample_key();

        assert_eq!(store.verify("example.com", 22, &key), Verification::Unknown);
        store.append("example.com", 22, &key).unwrap();
        assert_eq!(store.verify("example.com", 22, &key), Verification::Verified);

        // survives a reload from disk
        let reloaded = KnownHostsStore::open(store.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.verify("example.com", 22, &key), Verification::Verified);
    }

    #[test]
    fn changed_key_is_a_mismatch_and_file_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let first = sample_key();
        let second = sample_key();

        store.append("example.com", 22, &first).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        assert!(matches!(
            store.verify("example.com", 22, &second),
            Verification::Mismatch { .. }
        ));
        let after = fs::read_to_string(store.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn nonstandard_port_gets_bracketed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let key = sample_key();

        store.append("example.com", 2222, &key).unwrap();
        let contents = fs::read_to_string(store.path()).unwrap();
        assert!(contents.starts_with("[example.com]:2222 "));
        assert_eq!(store.verify("example.com", 2222, &key), Verification::Verified);
        assert_eq!(store.verify("example.com", 22, &key), Verification::Unknown);
    }

    #[test]
    fn strict_policy_records_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir));
        let key = sample_key();
        let policy = HostKeyPolicy::Strict {
            store: store.clone(),
            record: true,
        };

        assert!(policy.check("example.com", 22, &key).unwrap());
        assert_eq!(store.verify("example.com", 22, &key), Verification::Verified);

        let other = sample_key();
        assert!(matches!(
            policy.check("example.com", 22, &other),
            Err(TunnelError::HostKeyMismatch { .. })
        ));
    }

    #[test]
    fn grab_mode_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir));
        let key = sample_key();
        let policy = HostKeyPolicy::Strict {
            store: store.clone(),
            record: false,
        };

        assert!(policy.check("example.com", 22, &key).unwrap());
        assert_eq!(store.verify("example.com", 22, &key), Verification::Unknown);
    }
}
