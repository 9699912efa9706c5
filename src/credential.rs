//! Credentials with at-rest secret encryption.
//!
//! A [`Credential`] carries a username plus optional password, private-key
//! path, and private-key material. The two secrets are sealed with
//! AES-256-GCM under a key/nonce pair generated freshly for each secret on
//! each instance; key, nonce, and ciphertext live only in process memory for
//! the credential's lifetime. This guards against accidental logging and
//! serialization, not against inspection of process memory.
//!
//! No `Debug` or `Display` output of any type in this module ever contains
//! secret plaintext.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};

use crate::error::{Error, Result};

/// AES-GCM authentication tag length; the ciphertext of an empty plaintext
/// is exactly this long.
const TAG_LEN: usize = 16;

/// One secret sealed under its own single-use key and nonce.
pub struct EncryptedSecret {
    key: [u8; 32],
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

impl EncryptedSecret {
    /// Seal a plaintext secret. A fresh key and nonce are generated per call,
    /// so two seals of the same plaintext produce unrelated ciphertexts.
    pub fn seal(plaintext: &str) -> Result<Self> {
        let key: [u8; 32] = rand::random();
        let nonce: [u8; 12] = rand::random();

        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(Self {
            key,
            nonce,
            ciphertext,
        })
    }

    /// Unseal the secret back to its exact original plaintext.
    pub fn open(&self) -> Result<String> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("Invalid UTF-8 in decrypted secret".into()))
    }

    /// Whether the sealed plaintext is the empty string.
    pub fn is_empty(&self) -> bool {
        self.ciphertext.len() <= TAG_LEN
    }

    /// The sealed representation, for tests asserting it differs from the
    /// plaintext. Never log this; it is still derived from a secret.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

impl Clone for EncryptedSecret {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            nonce: self.nonce,
            ciphertext: self.ciphertext.clone(),
        }
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedSecret([REDACTED])")
    }
}

impl fmt::Display for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// A username plus optional secrets for one target.
///
/// Produced by a [`CredentialStore`](crate::auth::CredentialStore) or built
/// directly. Setters seal the secret before the field is assigned, so a
/// concurrent staleness read never observes a half-updated value.
#[derive(Clone, Default)]
pub struct Credential {
    user: String,
    password: Option<EncryptedSecret>,
    private_key: Option<PathBuf>,
    private_key_data: Option<EncryptedSecret>,
}

impl Credential {
    /// Create a credential with a username and no secrets.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    /// Builder: attach a password.
    pub fn with_password(mut self, password: &str) -> Result<Self> {
        self.set_password(password)?;
        Ok(self)
    }

    /// Builder: attach a private-key path.
    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Builder: attach raw private-key material.
    pub fn with_private_key_data(mut self, data: &str) -> Result<Self> {
        self.set_private_key_data(data)?;
        Ok(self)
    }

    /// The username.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Replace the username.
    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = user.into();
    }

    /// Decrypt and return the password, if one is set.
    pub fn password(&self) -> Result<Option<String>> {
        self.password.as_ref().map(EncryptedSecret::open).transpose()
    }

    /// Seal and store a password.
    pub fn set_password(&mut self, password: &str) -> Result<()> {
        let sealed = EncryptedSecret::seal(password)?;
        self.password = Some(sealed);
        Ok(())
    }

    /// The private-key path, if set.
    pub fn private_key(&self) -> Option<&Path> {
        self.private_key.as_deref()
    }

    /// Replace the private-key path.
    pub fn set_private_key(&mut self, path: impl Into<PathBuf>) {
        self.private_key = Some(path.into());
    }

    /// Decrypt and return the private-key material, if set.
    pub fn private_key_data(&self) -> Result<Option<String>> {
        self.private_key_data
            .as_ref()
            .map(EncryptedSecret::open)
            .transpose()
    }

    /// Seal and store private-key material.
    pub fn set_private_key_data(&mut self, data: &str) -> Result<()> {
        let sealed = EncryptedSecret::seal(data)?;
        self.private_key_data = Some(sealed);
        Ok(())
    }

    /// Whether a non-empty password is present.
    pub fn has_password(&self) -> bool {
        self.password.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Whether a cached copy of this credential may be reused without
    /// consulting the stores: both user and password must be populated.
    pub fn is_cache_valid(&self) -> bool {
        !self.user.is_empty() && self.has_password()
    }

    /// Decrypt into the view handed to a transport when opening a session.
    pub fn secret_set(&self) -> Result<SecretSet> {
        Ok(SecretSet {
            password: self.password()?,
            private_key: self.private_key.clone(),
            private_key_data: self.private_key_data()?,
        })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key)
            .field(
                "private_key_data",
                &self.private_key_data.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.user)
    }
}

/// Decrypted secrets for one session open, plus the basis for staleness
/// comparison against a freshly resolved credential.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretSet {
    /// Password plaintext.
    pub password: Option<String>,
    /// Private-key path.
    pub private_key: Option<PathBuf>,
    /// Private-key material plaintext.
    pub private_key_data: Option<String>,
}

impl SecretSet {
    /// Key material as an unordered set. Reconnect checks compare key
    /// material set-wise, so ordering differences alone never force a
    /// session rebuild.
    pub fn key_material(&self) -> BTreeSet<String> {
        let mut set = BTreeSet::new();
        if let Some(path) = &self.private_key {
            set.insert(format!("path:{}", path.display()));
        }
        if let Some(data) = &self.private_key_data {
            set.insert(format!("data:{}", data));
        }
        set
    }

    /// Whether a session built with `self` is still current for a
    /// credential that now resolves to `other`.
    pub fn matches(&self, other: &SecretSet) -> bool {
        self.password == other.password && self.key_material() == other.key_material()
    }
}

impl fmt::Debug for SecretSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSet")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key)
            .field(
                "private_key_data",
                &self.private_key_data.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let sealed = EncryptedSecret::seal("hunter2").unwrap();
        assert_eq!(sealed.open().unwrap(), "hunter2");
    }

    #[test]
    fn test_sealed_representation_differs_from_plaintext() {
        let sealed = EncryptedSecret::seal("hunter2").unwrap();
        assert_ne!(sealed.ciphertext(), b"hunter2");
    }

    #[test]
    fn test_fresh_key_per_seal() {
        let a = EncryptedSecret::seal("same").unwrap();
        let b = EncryptedSecret::seal("same").unwrap();
        assert_ne!(a.ciphertext(), b.ciphertext());
    }

    #[test]
    fn test_debug_and_display_never_leak_secrets() {
        let cred = Credential::new("deploy")
            .with_password("s3cr3t-pw")
            .unwrap()
            .with_private_key_data("-----BEGIN KEY-----\nabcdef\n-----END KEY-----")
            .unwrap();

        for rendered in [format!("{:?}", cred), format!("{}", cred)] {
            assert!(!rendered.contains("s3cr3t-pw"));
            assert!(!rendered.contains("abcdef"));
        }
        assert!(format!("{:?}", cred).contains("deploy"));
    }

    #[test]
    fn test_set_then_get_password_is_lossless() {
        let mut cred = Credential::new("deploy");
        cred.set_password("pässwörd with spaces\n").unwrap();
        assert_eq!(
            cred.password().unwrap().as_deref(),
            Some("pässwörd with spaces\n")
        );
    }

    #[test]
    fn test_cache_validity_requires_user_and_password() {
        assert!(!Credential::new("deploy").is_cache_valid());
        assert!(!Credential::new("").with_password("pw").unwrap().is_cache_valid());
        assert!(!Credential::new("deploy").with_password("").unwrap().is_cache_valid());
        assert!(Credential::new("deploy").with_password("pw").unwrap().is_cache_valid());
    }

    #[test]
    fn test_key_material_comparison_is_unordered() {
        let a = SecretSet {
            password: Some("pw".into()),
            private_key: Some("/keys/id_ed25519".into()),
            private_key_data: Some("material".into()),
        };
        let b = SecretSet {
            password: Some("pw".into()),
            private_key_data: Some("material".into()),
            private_key: Some("/keys/id_ed25519".into()),
        };
        assert!(a.matches(&b));

        let drifted = SecretSet {
            private_key: Some("/keys/id_rsa".into()),
            ..a.clone()
        };
        assert!(!a.matches(&drifted));
    }
}
