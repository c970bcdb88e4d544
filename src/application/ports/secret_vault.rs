use anyhow::{Context, Result};
use base64::Engine;

/// Opaque encrypt/decrypt of stored secrets.
pub trait SecretVault: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Seal a string and encode it as base64 text for storage.
pub fn seal_string(vault: &dyn SecretVault, plaintext: &str) -> Result<String> {
    let sealed = vault.seal(plaintext.as_bytes())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
}

/// Inverse of [`seal_string`].
pub fn open_string(vault: &dyn SecretVault, sealed: &str) -> Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(sealed)
        .context("sealed value is not base64")?;
    let plaintext = vault.open(&bytes)?;
    String::from_utf8(plaintext).context("sealed value is not utf8")
}
