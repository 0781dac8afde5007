//! Sector cipher for dxstor
//!
//! Sectors are encrypted with AES-256-GCM before they leave the client. The
//! nonce for each sector is derived deterministically from
//! `(file_id, segment_index, sector_index)`, so decryption needs no stored
//! nonce and re-encrypting an unchanged sector reproduces the same
//! ciphertext. Files are immutable once uploaded, so a position is never
//! encrypted twice with different plaintext.

use crate::error::{DxError, Result};
use crate::FileId;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use bytes::Bytes;
use std::fmt;

/// AES-256-GCM key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (12 bytes / 96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Cipher code persisted in file metadata for AES-256-GCM.
pub const CIPHER_CODE_GCM: u8 = 1;

/// AES-256-GCM encryption key
#[derive(Clone)]
pub struct CipherKey([u8; KEY_SIZE]);

impl CipherKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(DxError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CipherKey([REDACTED])")
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Cipher over a file's sectors
pub struct SectorCipher {
    cipher: Aes256Gcm,
}

impl SectorCipher {
    pub fn new(key: &CipherKey) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| DxError::Encryption(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Derive the deterministic nonce for a sector position.
    fn nonce(file_id: &FileId, segment_index: u64, sector_index: u32) -> [u8; NONCE_SIZE] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(file_id.0.as_bytes());
        hasher.update(&segment_index.to_le_bytes());
        hasher.update(&sector_index.to_le_bytes());
        let digest = hasher.finalize();
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest.as_bytes()[..NONCE_SIZE]);
        nonce
    }

    /// Encrypt one sector. The auth tag is appended to the ciphertext.
    pub fn encrypt_sector(
        &self,
        file_id: &FileId,
        segment_index: u64,
        sector_index: u32,
        plaintext: &[u8],
    ) -> Result<Bytes> {
        let nonce_bytes = Self::nonce(file_id, segment_index, sector_index);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| DxError::Encryption(e.to_string()))?;
        Ok(Bytes::from(ciphertext))
    }

    /// Decrypt one sector, verifying the auth tag.
    pub fn decrypt_sector(
        &self,
        file_id: &FileId,
        segment_index: u64,
        sector_index: u32,
        ciphertext: &[u8],
    ) -> Result<Bytes> {
        if ciphertext.len() < TAG_SIZE {
            return Err(DxError::Decryption(
                "ciphertext too short for auth tag".to_string(),
            ));
        }
        let nonce_bytes = Self::nonce(file_id, segment_index, sector_index);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| DxError::Decryption("authentication failed".to_string()))?;
        Ok(Bytes::from(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_slice_length() {
        assert!(CipherKey::from_slice(&[0u8; 16]).is_err());
        assert!(CipherKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_sector_roundtrip() {
        let key = CipherKey::generate();
        let cipher = SectorCipher::new(&key).unwrap();
        let file_id = FileId::new();

        let plaintext = b"sector payload";
        let ct = cipher.encrypt_sector(&file_id, 3, 7, plaintext).unwrap();
        assert_eq!(ct.len(), plaintext.len() + TAG_SIZE);

        let pt = cipher.decrypt_sector(&file_id, 3, 7, &ct).unwrap();
        assert_eq!(pt.as_ref(), plaintext);
    }

    #[test]
    fn test_deterministic_ciphertext() {
        let key = CipherKey::generate();
        let cipher = SectorCipher::new(&key).unwrap();
        let file_id = FileId::new();

        let a = cipher.encrypt_sector(&file_id, 0, 0, b"data").unwrap();
        let b = cipher.encrypt_sector(&file_id, 0, 0, b"data").unwrap();
        assert_eq!(a, b);

        // a different position yields a different ciphertext
        let c = cipher.encrypt_sector(&file_id, 0, 1, b"data").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_wrong_position_fails() {
        let key = CipherKey::generate();
        let cipher = SectorCipher::new(&key).unwrap();
        let file_id = FileId::new();

        let ct = cipher.encrypt_sector(&file_id, 1, 2, b"data").unwrap();
        assert!(cipher.decrypt_sector(&file_id, 1, 3, &ct).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = CipherKey::generate();
        let cipher = SectorCipher::new(&key).unwrap();
        let file_id = FileId::new();

        let mut ct = cipher.encrypt_sector(&file_id, 0, 0, b"data").unwrap().to_vec();
        ct[0] ^= 0xff;
        assert!(cipher.decrypt_sector(&file_id, 0, 0, &ct).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 = SectorCipher::new(&CipherKey::generate()).unwrap();
        let cipher2 = SectorCipher::new(&CipherKey::generate()).unwrap();
        let file_id = FileId::new();

        let ct = cipher1.encrypt_sector(&file_id, 0, 0, b"data").unwrap();
        assert!(cipher2.decrypt_sector(&file_id, 0, 0, &ct).is_err());
    }
}
