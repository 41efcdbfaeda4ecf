//! Optional per-chunk AEAD transform.
//!
//! When a transfer is encrypted, each chunk is sealed independently with
//! ChaCha20-Poly1305: a fresh 12-byte nonce is prepended and a 16-byte tag
//! appended, 28 bytes of overhead per chunk. The Merkle tree is built over
//! the sealed bytes, so receivers verify proofs before opening anything.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::TransferError;
use crate::merkle::CHUNK_SIZE;

/// Per-chunk overhead: 12-byte nonce plus 16-byte authenticator tag
pub const SEAL_OVERHEAD: usize = 28;

/// Effective plaintext chunk size when chunk encryption is in use
pub const ENCRYPTED_CHUNK_SIZE: usize = CHUNK_SIZE - SEAL_OVERHEAD;

const NONCE_SIZE: usize = 12;

/// Symmetric chunk cipher shared by both transfer peers
pub struct ChunkCipher {
    cipher: ChaCha20Poly1305,
}

impl ChunkCipher {
    /// Create a cipher from a 32-byte key
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Seal one plaintext chunk: `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| TransferError::Cipher("seal failed"))?;
        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open one sealed chunk
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, TransferError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(TransferError::Cipher("sealed chunk shorter than overhead"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TransferError::Cipher("authentication failed"))
    }
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher").finish_non_exhaustive()
    }
}
