//! Key material: identity loading, host-key load-or-generate, and
//! authorized_keys parsing.

use std::{
    collections::HashSet, fs, path::Path
};

use russh::keys::{
    self, HashAlg, PrivateKey, PublicKey, PublicKeyBase64, ssh_key::{
        LineEnding, private::{KeypairData, RsaKeypair}, rand_core::OsRng
    }
};
use tracing::{debug, info};

use crate::error::{TunnelError, TunnelResult};

const GENERATED_KEY_BITS: usize = 2048;

/// Load a private key from an OpenSSH or PEM file, prompting for a
/// passphrase only when the key is encrypted.
pub fn load_identity(path: &Path) -> TunnelResult<PrivateKey> {
    let data = fs::read_to_string(path).map_err(|e| TunnelError::key_load(path, e.to_string()))?;
    match PrivateKey::from_openssh(&data) {
        Ok(key) => Ok(key),
        Err(_) => match keys::decode_secret_key(&data, None) {
            Ok(key) => Ok(key),
            Err(keys::Error::KeyIsEncrypted) => {
                let prompt = format!("Enter passphrase for {}: ", path.display());
                let passphrase = rpassword::prompt_password(prompt).map_err(TunnelError::Io)?;
                keys::decode_secret_key(&data, Some(&passphrase))
                    .map_err(|e| TunnelError::key_load(path, format!("failed to decrypt: {e}")))
            }
            Err(err) => Err(TunnelError::key_load(path, err.to_string())),
        },
    }
}

/// Load the server host key, generating and persisting a fresh RSA-2048
/// key (plus its `.pub` sibling) when the file does not exist yet.
pub fn load_or_create_host_key(path: &Path) -> TunnelResult<PrivateKey> {
    if path.exists() {
        let key = load_identity(path)?;
        info!(path = %path.display(), "loaded server host key");
        return Ok(key);
    }

    let keypair = RsaKeypair::random(&mut OsRng, GENERATED_KEY_BITS)
        .map_err(|e| TunnelError::key_load(path, e.to_string()))?;
    let key = PrivateKey::new(KeypairData::Rsa(keypair), "")
        .map_err(|e| TunnelError::key_load(path, e.to_string()))?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| TunnelError::key_load(path, e.to_string()))?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    write_private(path, pem.as_bytes())?;
    let public = key
        .public_key()
        .to_openssh()
        .map_err(|e| TunnelError::key_load(path, e.to_string()))?;
    fs::write(path.with_extension("pub"), format!("{public}\n"))?;

    info!(path = %path.display(), "generated new server host key");
    Ok(key)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::{io::Write, os::unix::fs::OpenOptionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}

/// Parse an OpenSSH `authorized_keys` file into the set of wire-marshalled
/// key blobs used for authentication equality checks.
pub fn load_authorized_keys(path: &Path) -> TunnelResult<HashSet<Vec<u8>>> {
    let data = fs::read_to_string(path).map_err(|e| TunnelError::key_load(path, e.to_string()))?;
    let mut keys = HashSet::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let key = PublicKey::from_openssh(line)
            .map_err(|e| TunnelError::key_load(path, format!("bad authorized key entry: {e}")))?;
        debug!(fingerprint = %key.fingerprint(HashAlg::Sha256), "authorized key loaded");
        keys.insert(key.public_key_bytes());
    }
    info!(path = %path.display(), count = keys.len(), "authorized keys loaded");
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::Algorithm;

    fn sample_public_line() -> String {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        key.public_key().to_openssh().unwrap()
    }

    #[test]
    fn authorized_keys_parses_entries_and_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let contents = format!("# a comment\n\n{}\n{}\n", sample_public_line(), sample_public_line());
        fs::write(&path, contents).unwrap();

        let keys = load_authorized_keys(&path).unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn empty_authorized_keys_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        fs::write(&path, "").unwrap();

        let keys = load_authorized_keys(&path).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn garbage_authorized_keys_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        fs::write(&path, "not a key\n").unwrap();

        assert!(load_authorized_keys(&path).is_err());
    }

    #[test]
    fn host_key_is_generated_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");

        let first = load_or_create_host_key(&path).unwrap();
        assert!(path.exists());
        assert!(path.with_extension("pub").exists());

        let second = load_or_create_host_key(&path).unwrap();
        assert_eq!(
            first.public_key().public_key_bytes(),
            second.public_key().public_key_bytes()
        );
    }
}
