// Per-session AEAD bound to (ssrc, counter) via the suite nonce base.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use thiserror::Error;

use crate::suite::{AeadKind, CryptoSuite, NONCE_BASE_SIZE};

/// Authentication tag size for both families.
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown aead: {0}")]
    UnknownAead(String),
    #[error("invalid suite field: {0}")]
    InvalidSuiteField(&'static str),
    #[error("authentication failed")]
    Authentication,
    #[error("ciphertext too short")]
    CiphertextTooShort,
}

enum Cipher {
    Gcm(Box<Aes256Gcm>),
    XChaCha(Box<XChaCha20Poly1305>),
}

/// Session crypto handle derived from a room's crypto suite.
///
/// The nonce for a packet is the suite's 12-byte nonce base XORed with
/// `ssrc_be || counter_be`, zero-padded to 24 bytes for XChaCha20-Poly1305.
/// The 24-byte media header is the associated data.
pub struct SessionCrypto {
    cipher: Cipher,
    nonce_base: [u8; NONCE_BASE_SIZE],
    key_id: [u8; 4],
}

impl SessionCrypto {
    pub fn new(suite: &CryptoSuite) -> Self {
        let cipher = match suite.aead {
            AeadKind::Aes256Gcm => Cipher::Gcm(Box::new(
                Aes256Gcm::new_from_slice(&suite.key_material).expect("32-byte key"),
            )),
            AeadKind::XChaCha20Poly1305 => Cipher::XChaCha(Box::new(
                XChaCha20Poly1305::new_from_slice(&suite.key_material).expect("32-byte key"),
            )),
        };
        Self {
            cipher,
            nonce_base: suite.nonce_base,
            key_id: suite.key_id,
        }
    }

    /// The one-byte suite generation tag expected in media headers.
    pub fn short_key_id(&self) -> u8 {
        self.key_id[0]
    }

    fn nonce12(&self, ssrc: u32, counter: u64) -> [u8; NONCE_BASE_SIZE] {
        let mut nonce = self.nonce_base;
        let ssrc_be = ssrc.to_be_bytes();
        let counter_be = counter.to_be_bytes();
        for (i, b) in ssrc_be.iter().enumerate() {
            nonce[i] ^= b;
        }
        for (i, b) in counter_be.iter().enumerate() {
            nonce[4 + i] ^= b;
        }
        nonce
    }

    pub fn encrypt(
        &self,
        aad: &[u8],
        ssrc: u32,
        counter: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let nonce12 = self.nonce12(ssrc, counter);
        match &self.cipher {
            Cipher::Gcm(cipher) => cipher
                .encrypt(Nonce::from_slice(&nonce12), payload)
                .map_err(|_| CryptoError::Authentication),
            Cipher::XChaCha(cipher) => {
                let mut nonce24 = [0u8; 24];
                nonce24[..NONCE_BASE_SIZE].copy_from_slice(&nonce12);
                cipher
                    .encrypt(XNonce::from_slice(&nonce24), payload)
                    .map_err(|_| CryptoError::Authentication)
            }
        }
    }

    pub fn decrypt(
        &self,
        aad: &[u8],
        ssrc: u32,
        counter: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort);
        }
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let nonce12 = self.nonce12(ssrc, counter);
        match &self.cipher {
            Cipher::Gcm(cipher) => cipher
                .decrypt(Nonce::from_slice(&nonce12), payload)
                .map_err(|_| CryptoError::Authentication),
            Cipher::XChaCha(cipher) => {
                let mut nonce24 = [0u8; 24];
                nonce24[..NONCE_BASE_SIZE].copy_from_slice(&nonce12);
                cipher
                    .decrypt(XNonce::from_slice(&nonce24), payload)
                    .map_err(|_| CryptoError::Authentication)
            }
        }
    }
}
