//! Symmetric encrypter for secrets embedded in node bootstrap configuration.
//!
//! AES-256 in CTR mode: ciphertext and plaintext have the same length, there
//! is no padding and no authentication tag. The node decrypts on first boot
//! with the key and IV it receives through its scale set model.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::error::EncrypterError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Key length in bytes.
pub const KEY_LEN: usize = 32;
/// Initial vector length in bytes.
pub const IV_LEN: usize = 16;

/// Key and initial vector for one cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKeyMaterial {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
}

impl EncryptionKeyMaterial {
    /// Build key material from raw slices, validating lengths.
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self, EncrypterError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| EncrypterError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            })?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| EncrypterError::InvalidIvLength {
            expected: IV_LEN,
            actual: iv.len(),
        })?;
        Ok(Self { key, iv })
    }

    /// Build key material from hex strings as produced by [`Encrypter::encryption_key`]
    /// and [`Encrypter::initial_vector`].
    pub fn from_hex(key: &str, iv: &str) -> Result<Self, EncrypterError> {
        let key = hex::decode(key.trim())?;
        let iv = hex::decode(iv.trim())?;
        Self::from_slices(&key, &iv)
    }
}

// Never print key bytes.
impl std::fmt::Debug for EncryptionKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyMaterial")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// Stream-cipher encrypter keyed by a fixed key and IV.
#[derive(Debug, Clone)]
pub struct Encrypter {
    material: EncryptionKeyMaterial,
}

impl Encrypter {
    pub fn new(material: EncryptionKeyMaterial) -> Self {
        Self { material }
    }

    /// Construct from raw key and IV bytes.
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self, EncrypterError> {
        EncryptionKeyMaterial::from_slices(key, iv).map(Self::new)
    }

    fn cipher(&self) -> Aes256Ctr {
        Aes256Ctr::new(&self.material.key.into(), &self.material.iv.into())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        self.cipher().apply_keystream(&mut buf);
        buf
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = ciphertext.to_vec();
        self.cipher().apply_keystream(&mut buf);
        buf
    }

    /// Hex encoded key for delivery to nodes.
    pub fn encryption_key(&self) -> String {
        hex::encode(self.material.key)
    }

    /// Hex encoded initial vector for delivery to nodes.
    pub fn initial_vector(&self) -> String {
        hex::encode(self.material.iv)
    }
}
