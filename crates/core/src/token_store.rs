//! Secure Token Store: persists the rotating refresh token to
//! `<rootPath>/refresh.blob`. The encryption scheme itself is out of
//! scope here — callers plug in a [`TokenCipher`]; [`PlaintextCipher`] is
//! the reference (identity) implementation used when no OS keychain is
//! wired up. The only contract the core relies on is `load ∘ save = id`
//! on the same host.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use fs2::FileExt;
use kraken_agent_domain::error::{Error, Result};

pub trait TokenCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Identity cipher. Stands in for a real OS-keychain or DPAPI-backed
/// implementation, which is a black box to this crate.
#[derive(Debug, Default)]
pub struct PlaintextCipher;

impl TokenCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

pub struct SecureTokenStore<C: TokenCipher = PlaintextCipher> {
    cipher: C,
}

impl Default for SecureTokenStore<PlaintextCipher> {
    fn default() -> Self {
        Self { cipher: PlaintextCipher }
    }
}

impl<C: TokenCipher> SecureTokenStore<C> {
    pub fn with_cipher(cipher: C) -> Self {
        Self { cipher }
    }

    fn blob_path(root_path: &Path) -> std::path::PathBuf {
        root_path.join("refresh.blob")
    }

    /// `platform_tag` identifies the principal/keychain namespace a real
    /// cipher would scope to; the reference cipher ignores it.
    pub fn save(&self, _platform_tag: &str, root_path: &Path, token: &str) -> Result<()> {
        std::fs::create_dir_all(root_path)?;
        let path = Self::blob_path(root_path);
        let ciphertext = self.cipher.encrypt(token.as_bytes())?;

        let mut open_opts = OpenOptions::new();
        open_opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open_opts.mode(0o600);
        }
        let file = open_opts.open(&path)?;
        file.lock_exclusive()?;
        let result = (|| -> Result<()> {
            let mut file = &file;
            file.write_all(&ciphertext)?;
            file.sync_all()?;
            Ok(())
        })();
        let _ = FileExt::unlock(&file);
        result?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }

    pub fn load(&self, _platform_tag: &str, root_path: &Path) -> Result<Option<String>> {
        let path = Self::blob_path(root_path);
        if !path.exists() {
            return Ok(None);
        }
        let file = OpenOptions::new().read(true).open(&path)?;
        file.lock_shared()?;
        let mut ciphertext = Vec::new();
        let result = (|| -> Result<()> {
            let mut f = &file;
            f.read_to_end(&mut ciphertext)?;
            Ok(())
        })();
        let _ = FileExt::unlock(&file);
        result?;

        let plaintext = self.cipher.decrypt(&ciphertext)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|e| Error::Other(format!("refresh.blob is not valid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecureTokenStore::default();
        store.save("linux-x64", dir.path(), "rt-12345").unwrap();
        let loaded = store.load("linux-x64", dir.path()).unwrap();
        assert_eq!(loaded, Some("rt-12345".to_string()));
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecureTokenStore::default();
        assert_eq!(store.load("linux-x64", dir.path()).unwrap(), None);
    }

    #[test]
    fn save_overwrites_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecureTokenStore::default();
        store.save("linux-x64", dir.path(), "first").unwrap();
        store.save("linux-x64", dir.path(), "second").unwrap();
        assert_eq!(store.load("linux-x64", dir.path()).unwrap(), Some("second".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn blob_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = SecureTokenStore::default();
        store.save("linux-x64", dir.path(), "rt-12345").unwrap();
        let meta = std::fs::metadata(dir.path().join("refresh.blob")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
