use base64::{engine::general_purpose::STANDARD as B64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use chorus_proto::CryptoParams;

use crate::aead::CryptoError;

/// Symmetric key size shared by both AEAD families.
pub const KEY_SIZE: usize = 32;
/// Per-suite random nonce prefix, XORed with (ssrc || counter).
pub const NONCE_BASE_SIZE: usize = 12;
/// Key-id tag length.
pub const KEY_ID_SIZE: usize = 4;

/// AEAD family of a crypto suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    Aes256Gcm,
    XChaCha20Poly1305,
}

impl AeadKind {
    /// Wire name carried in HELLO payloads and join responses.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes256-gcm",
            Self::XChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    pub fn parse(name: &str) -> Result<Self, CryptoError> {
        match name {
            "aes256-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" => Ok(Self::XChaCha20Poly1305),
            other => Err(CryptoError::UnknownAead(other.to_string())),
        }
    }
}

/// Per-room crypto suite. Issued by the assignment service, delivered to
/// every joiner of the room, and installed on each media session at HELLO.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoSuite {
    pub aead: AeadKind,
    pub key_id: [u8; KEY_ID_SIZE],
    pub key_material: [u8; KEY_SIZE],
    pub nonce_base: [u8; NONCE_BASE_SIZE],
}

impl std::fmt::Debug for CryptoSuite {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSuite")
            .field("aead", &self.aead.as_str())
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl CryptoSuite {
    /// Generate a fresh suite: one 32-byte seed expanded with HKDF-SHA256
    /// into key material and nonce base, plus a random key id.
    pub fn generate(aead: AeadKind) -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);

        let hk = Hkdf::<Sha256>::new(None, &seed);
        let mut key_material = [0u8; KEY_SIZE];
        hk.expand(b"chorus media key", &mut key_material)
            .expect("hkdf output length is valid");
        let mut nonce_base = [0u8; NONCE_BASE_SIZE];
        hk.expand(b"chorus nonce base", &mut nonce_base)
            .expect("hkdf output length is valid");

        let mut key_id = [0u8; KEY_ID_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key_id);

        Self {
            aead,
            key_id,
            key_material,
            nonce_base,
        }
    }

    /// The one-byte suite generation tag carried in media headers.
    pub fn short_key_id(&self) -> u8 {
        self.key_id[0]
    }

    /// Wire representation with base64-encoded key bytes.
    pub fn to_params(&self) -> CryptoParams {
        CryptoParams {
            aead: self.aead.as_str().to_string(),
            key_id: B64.encode(self.key_id),
            key_material: B64.encode(self.key_material),
            nonce_base: B64.encode(self.nonce_base),
        }
    }

    pub fn from_params(params: &CryptoParams) -> Result<Self, CryptoError> {
        let aead = AeadKind::parse(&params.aead)?;
        let key_id = decode_fixed::<KEY_ID_SIZE>(&params.key_id, "key_id")?;
        let key_material = decode_fixed::<KEY_SIZE>(&params.key_material, "key_material")?;
        let nonce_base = decode_fixed::<NONCE_BASE_SIZE>(&params.nonce_base, "nonce_base")?;
        Ok(Self {
            aead,
            key_id,
            key_material,
            nonce_base,
        })
    }
}

fn decode_fixed<const N: usize>(encoded: &str, field: &'static str) -> Result<[u8; N], CryptoError> {
    let raw = B64
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidSuiteField(field))?;
    raw.try_into()
        .map_err(|_| CryptoError::InvalidSuiteField(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_unique() {
        let a = CryptoSuite::generate(AeadKind::Aes256Gcm);
        let b = CryptoSuite::generate(AeadKind::Aes256Gcm);
        assert_ne!(a.key_material, b.key_material);
        assert_ne!(a.nonce_base, b.nonce_base);
    }

    #[test]
    fn params_round_trip() {
        let suite = CryptoSuite::generate(AeadKind::XChaCha20Poly1305);
        let params = suite.to_params();
        assert_eq!(params.aead, "chacha20-poly1305");
        let back = CryptoSuite::from_params(&params).unwrap();
        assert_eq!(back, suite);
    }

    #[test]
    fn bad_key_length_rejected() {
        let suite = CryptoSuite::generate(AeadKind::Aes256Gcm);
        let mut params = suite.to_params();
        params.key_material = B64.encode([0u8; 16]);
        assert!(matches!(
            CryptoSuite::from_params(&params),
            Err(CryptoError::InvalidSuiteField("key_material"))
        ));
    }

    #[test]
    fn unknown_aead_rejected() {
        let suite = CryptoSuite::generate(AeadKind::Aes256Gcm);
        let mut params = suite.to_params();
        params.aead = "aes128-gcm".into();
        assert!(matches!(
            CryptoSuite::from_params(&params),
            Err(CryptoError::UnknownAead(_))
        ));
    }

    #[test]
    fn debug_hides_key_material() {
        let suite = CryptoSuite::generate(AeadKind::Aes256Gcm);
        let rendered = format!("{suite:?}");
        assert!(!rendered.contains("key_material"));
    }
}
