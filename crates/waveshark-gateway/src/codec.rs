//! Message encryption for the shared topic
//!
//! Every payload published on the topic is AES-128-CBC ciphertext of the
//! UTF-8 plaintext envelope, PKCS#7 padded, carried as a base-64 token.
//!
//! # Determinism
//!
//! The key and IV are both fixed for the lifetime of the process, so the
//! same plaintext always produces the same token. There is no nonce and no
//! replay protection; the only trust anchor is possession of the shared key.

use aes::Aes128;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::config::{EncryptionConfig, KEY_MATERIAL_LEN};
use crate::error::{CodecError, GatewayError, Result};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size in bytes
const BLOCK_SIZE: usize = 16;

/// Stateless encrypt/decrypt of text under a pre-shared key and IV
#[derive(Clone)]
pub struct MessageCodec {
    key: [u8; KEY_MATERIAL_LEN],
    iv: [u8; KEY_MATERIAL_LEN],
}

impl MessageCodec {
    /// Create a codec from raw key and IV bytes
    pub fn new(key: [u8; KEY_MATERIAL_LEN], iv: [u8; KEY_MATERIAL_LEN]) -> Self {
        Self { key, iv }
    }

    /// Create a codec from 16-character key and IV strings
    pub fn from_text(key: &str, iv: &str) -> Result<Self> {
        Ok(Self::new(key_material("key", key)?, key_material("iv", iv)?))
    }

    /// Create from encryption configuration
    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        Self::from_text(&config.key, &config.iv)
    }

    /// Encrypt `plaintext` into a base-64 token
    pub fn encrypt(&self, plaintext: &str) -> String {
        let encryptor = Aes128CbcEnc::new(&self.key.into(), &self.iv.into());
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        STANDARD.encode(ciphertext)
    }

    /// Decrypt a base-64 token back into text
    ///
    /// # Errors
    ///
    /// - [`CodecError::Decode`] if the token is not base-64
    /// - [`CodecError::Cipher`] if the ciphertext is empty, not block-aligned
    ///   or carries invalid padding (wrong key/IV, corrupted token)
    /// - [`CodecError::Text`] if the plaintext is not UTF-8
    pub fn decrypt(&self, token: &str) -> std::result::Result<String, CodecError> {
        let ciphertext = STANDARD
            .decode(token.trim())
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CodecError::Cipher(format!(
                "ciphertext length {} is not a positive multiple of {}",
                ciphertext.len(),
                BLOCK_SIZE
            )));
        }

        let decryptor = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
        let plaintext = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CodecError::Cipher("invalid padding".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CodecError::Text(e.to_string()))
    }
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec").finish_non_exhaustive()
    }
}

fn key_material(what: &'static str, text: &str) -> Result<[u8; KEY_MATERIAL_LEN]> {
    text.as_bytes()
        .try_into()
        .map_err(|_| GatewayError::InvalidKeyMaterial {
            what,
            len: text.len(),
        })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn codec_roundtrip(
            key in any::<[u8; 16]>(),
            iv in any::<[u8; 16]>(),
            plaintext in ".*",
        ) {
            let codec = MessageCodec::new(key, iv);
            let token = codec.encrypt(&plaintext);
            prop_assert_eq!(codec.decrypt(&token).unwrap(), plaintext);
        }
    }
}
