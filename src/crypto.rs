use crate::errors::AuthError;
use aes::Aes192;
use aes_gcm::{
    aead::{generic_array::typenum::U12, Aead, OsRng},
    AeadCore, Aes128Gcm, Aes256Gcm, AesGcm, KeyInit, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

type Aes192Gcm = AesGcm<Aes192, U12>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Symmetric cipher for token payloads at rest in cookies.
///
/// The wire format is `base64(nonce ∥ ciphertext ∥ tag)` with a fresh random
/// nonce per encryption. The key length selects AES-128, AES-192 or AES-256.
pub struct TokenCipher {
    cipher: Cipher,
}

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl TokenCipher {
    pub fn new(key: &[u8]) -> Result<Self, AuthError> {
        let invalid =
            |_| AuthError::Config("encryption key must be 16, 24 or 32 bytes".to_string());
        let cipher = match key.len() {
            16 => Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
            24 => Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            32 => Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
            len => {
                return Err(AuthError::Config(format!(
                    "encryption key must be 16, 24 or 32 bytes, got {len}"
                )))
            }
        };
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, AuthError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphered = match &self.cipher {
            Cipher::Aes128(c) => c.encrypt(&nonce, plaintext.as_bytes()),
            Cipher::Aes192(c) => c.encrypt(&nonce, plaintext.as_bytes()),
            Cipher::Aes256(c) => c.encrypt(&nonce, plaintext.as_bytes()),
        }
        .map_err(|err| AuthError::Encode(err.to_string()))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphered);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String, AuthError> {
        let raw = STANDARD.decode(sealed).map_err(|_| AuthError::Encryption)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(AuthError::Encryption);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);

        let plaintext = match &self.cipher {
            Cipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes192(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| AuthError::Encryption)?;

        String::from_utf8(plaintext).map_err(|_| AuthError::Encryption)
    }
}
