/*!
Symmetric encryption for at-rest secrets: provider API keys, IMAP passwords
and proxy credentials. The key lives in a mode-restricted file under the
data directory; tests supply a temporary key path.
*/

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use std::path::{Path, PathBuf};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretBox {
    key: [u8; KEY_LEN],
}

impl SecretBox {
    /// Load the key file, creating it with fresh random bytes on first run.
    pub fn open(key_path: &Path) -> Result<Self> {
        let key = if key_path.exists() {
            let raw = std::fs::read(key_path)
                .with_context(|| format!("failed to read key file {}", key_path.display()))?;
            if raw.len() != KEY_LEN {
                anyhow::bail!("key file {} has wrong length", key_path.display());
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&raw);
            key
        } else {
            if let Some(parent) = key_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let mut key = [0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            std::fs::write(key_path, key)
                .with_context(|| format!("failed to write key file {}", key_path.display()))?;
            restrict_mode(key_path)?;
            key
        };
        Ok(SecretBox { key })
    }

    /// Conventional location: `<data_dir>/secret.key`.
    pub fn default_path(data_dir: &str) -> PathBuf {
        Path::new(data_dir).join("secret.key")
    }

    /// Encrypt to base64( nonce || ciphertext ).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(B64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = B64.decode(encoded).context("secret is not valid base64")?;
        if raw.len() < NONCE_LEN {
            anyhow::bail!("secret is truncated");
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption failed (wrong key?)"))?;
        String::from_utf8(plaintext).context("decrypted secret is not UTF-8")
    }
}

#[cfg(unix)]
fn restrict_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("secret.key");
        let sb = SecretBox::open(&key_path).unwrap();

        let enc = sb.encrypt("imap-password").unwrap();
        assert_ne!(enc, "imap-password");
        assert_eq!(sb.decrypt(&enc).unwrap(), "imap-password");

        // Reopening the same key file decrypts existing secrets.
        let sb2 = SecretBox::open(&key_path).unwrap();
        assert_eq!(sb2.decrypt(&enc).unwrap(), "imap-password");
    }

    #[test]
    fn distinct_nonces_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SecretBox::open(&dir.path().join("k")).unwrap();
        let a = sb.encrypt("x").unwrap();
        let b = sb.encrypt("x").unwrap();
        assert_ne!(a, b);
    }
}
