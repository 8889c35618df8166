//! AES-256-CBC object encryption.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use crate::storage::{StorageError, StorageResult};

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Symmetric cipher applied to each stored object.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

/// `material` itself when it has exactly `N` bytes, else the head of its SHA-256.
fn derive<const N: usize>(material: &str) -> [u8; N] {
    let mut out = [0u8; N];
    if material.len() == N {
        out.copy_from_slice(material.as_bytes());
    } else {
        let digest = Sha256::digest(material.as_bytes());
        out.copy_from_slice(&digest.as_slice()[..N]);
    }
    out
}

impl Cipher {
    pub fn new(secret: &str, iv: &str) -> Self {
        Self {
            key: derive::<KEY_LEN>(secret),
            iv: derive::<IV_LEN>(iv),
        }
    }

    pub fn encrypt(&self, plain: &[u8]) -> StorageResult<Vec<u8>> {
        let encryptor = Encryptor::new_from_slices(&self.key, &self.iv).map_err(|e| {
            StorageError::Encryption {
                message: e.to_string(),
            }
        })?;
        Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain))
    }

    pub fn decrypt(&self, data: &[u8]) -> StorageResult<Vec<u8>> {
        let decryptor = Decryptor::new_from_slices(&self.key, &self.iv).map_err(|e| {
            StorageError::Encryption {
                message: e.to_string(),
            }
        })?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|e| StorageError::Encryption {
                message: format!("cannot decrypt object: {}", e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = Cipher::new("secret", "iv");
        let encrypted = cipher.encrypt(b"hello drive").unwrap();
        assert_ne!(&encrypted[..], b"hello drive");
        assert_eq!(encrypted.len() % 16, 0);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"hello drive");
    }

    #[test]
    fn test_exact_length_material_is_used_verbatim() {
        let key = "0123456789abcdef0123456789abcdef";
        assert_eq!(derive::<KEY_LEN>(key), *key.as_bytes().first_chunk::<32>().unwrap());
        let hashed = derive::<IV_LEN>("short");
        assert_eq!(&hashed[..], &Sha256::digest(b"short").as_slice()[..16]);
    }

    #[test]
    fn test_wrong_key_fails_to_decrypt() {
        let encrypted = Cipher::new("one", "iv").encrypt(&[7u8; 40]).unwrap();
        let other = Cipher::new("two", "iv").decrypt(&encrypted);
        // a wrong key almost always breaks the padding; never returns the plaintext
        if let Ok(plain) = other {
            assert_ne!(plain, vec![7u8; 40]);
        }
    }
}
