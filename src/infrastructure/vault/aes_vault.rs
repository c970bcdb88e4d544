use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::info;

use crate::application::ports::SecretVault;

const NONCE_LEN: usize = 12;

/// Where the 32-byte vault key comes from.
#[derive(Clone)]
pub enum KeySource {
    /// Base64 text, usually from `STACKHOOK_VAULT_KEY`.
    Inline(String),
    /// Raw key file; generated with mode 0600 on first use when missing.
    File(PathBuf),
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Inline(_) => f.write_str("Inline(***)"),
            KeySource::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// AES-256-GCM vault. Sealed layout is `nonce(12) || ciphertext`.
///
/// The cipher is built on first seal/open, so a missing key only matters
/// once a secret is actually stored or read.
pub struct AesGcmVault {
    source: KeySource,
    cipher: OnceLock<Aes256Gcm>,
}

impl AesGcmVault {
    pub fn new(source: KeySource) -> Self {
        Self {
            source,
            cipher: OnceLock::new(),
        }
    }

    /// `STACKHOOK_VAULT_KEY` if set, else `<data_dir>/vault.key`.
    pub fn from_env_or_file(env_key: Option<String>, data_dir: &std::path::Path) -> Self {
        match env_key {
            Some(key) if !key.trim().is_empty() => Self::new(KeySource::Inline(key)),
            _ => Self::new(KeySource::File(data_dir.join("vault.key"))),
        }
    }

    fn cipher(&self) -> Result<&Aes256Gcm> {
        if let Some(cipher) = self.cipher.get() {
            return Ok(cipher);
        }

        let key = self.load_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key).context("invalid vault key")?;
        // A concurrent initializer may have won; either cipher uses the same key.
        let _ = self.cipher.set(cipher);
        self.cipher.get().context("vault cipher not initialized")
    }

    fn load_key(&self) -> Result<Vec<u8>> {
        match &self.source {
            KeySource::Inline(encoded) => {
                let key = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .context("STACKHOOK_VAULT_KEY must be base64")?;
                if key.len() != 32 {
                    anyhow::bail!("STACKHOOK_VAULT_KEY must decode to 32 bytes");
                }
                Ok(key)
            }
            KeySource::File(path) => {
                if path.exists() {
                    let key = std::fs::read(path)
                        .with_context(|| format!("Failed to read vault key {}", path.display()))?;
                    if key.len() != 32 {
                        anyhow::bail!("vault key file {} must hold 32 bytes", path.display());
                    }
                    return Ok(key);
                }

                let mut key = vec![0_u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                write_private_file(path, &key)?;
                info!("Generated new vault key at {}", path.display());
                Ok(key)
            }
        }
    }
}

impl SecretVault for AesGcmVault {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut nonce_bytes = [0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            anyhow::bail!("sealed value malformed");
        }
        let cipher = self.cipher()?;
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| anyhow::anyhow!("decryption failed"))
    }
}

/// Write `contents` to `path` readable by the owner only.
pub fn write_private_file(path: &std::path::Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(contents)?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{open_string, seal_string};

    #[test]
    fn test_seal_open_with_generated_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let vault = AesGcmVault::from_env_or_file(None, dir.path());

        let sealed = seal_string(&vault, "hunter2").unwrap();
        assert!(!sealed.contains("hunter2"));
        assert_eq!(open_string(&vault, &sealed).unwrap(), "hunter2");
        assert!(dir.path().join("vault.key").exists());

        // A second vault over the same file opens earlier values
        let reopened = AesGcmVault::from_env_or_file(None, dir.path());
        assert_eq!(open_string(&reopened, &sealed).unwrap(), "hunter2");
    }

    #[test]
    fn test_tampered_value_fails() {
        let key = base64::engine::general_purpose::STANDARD.encode([7_u8; 32]);
        let vault = AesGcmVault::new(KeySource::Inline(key));

        let mut sealed = vault.seal(b"token").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert!(vault.open(&sealed).is_err());
        assert!(vault.open(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_bad_inline_key_is_reported_on_use() {
        let vault = AesGcmVault::new(KeySource::Inline("c2hvcnQ=".into()));
        assert!(vault.seal(b"x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let vault = AesGcmVault::from_env_or_file(None, dir.path());
        vault.seal(b"x").unwrap();

        let mode = std::fs::metadata(dir.path().join("vault.key")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
