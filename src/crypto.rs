use std::fmt;

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use crypto_hash::{digest, Algorithm};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const AES_KEY_SIZE: usize = 32;
pub const AES_IV_SIZE: usize = 16;
pub const HASH_KEY_SIZE: usize = 32;
const AES_BLOCK_SIZE: usize = 16;
const TAG_SIZE: usize = 32;
const HMAC_BLOCK_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext is not hex encoded: {0}")]
    Encoding(String),
    #[error("ciphertext length {0} does not fit blocks plus tag")]
    Length(usize),
    #[error("authentication tag mismatch")]
    Integrity,
    #[error("bad padding")]
    Padding,
    #[error("plaintext is not valid utf-8")]
    Utf8,
}

/// Per-run secrets handed by the client to both data holders.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub aes_key: [u8; AES_KEY_SIZE],
    pub iv: [u8; AES_IV_SIZE],
    pub hash_key: [u8; HASH_KEY_SIZE],
}

impl KeyMaterial {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut aes_key = [0u8; AES_KEY_SIZE];
        let mut iv = [0u8; AES_IV_SIZE];
        let mut hash_key = [0u8; HASH_KEY_SIZE];
        rng.fill_bytes(&mut aes_key);
        rng.fill_bytes(&mut iv);
        rng.fill_bytes(&mut hash_key);
        Self {
            aes_key,
            iv,
            hash_key,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Deterministic AES-256-CBC over join values and payloads, plus the keyed
/// hash used for twin sampling. The IV is fixed for a run so that equal
/// plaintexts on both holders produce equal ciphertexts.
///
/// Ciphertexts are `hex(cbc || tag)` where the tag is HMAC-SHA256 over
/// `iv || cbc` under a key derived from both secrets; `decrypt` checks the
/// tag before touching the cipher.
#[derive(Clone)]
pub struct CryptoBox {
    keys: KeyMaterial,
    mac_key: [u8; HMAC_BLOCK_SIZE],
}

impl fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoBox").finish_non_exhaustive()
    }
}

impl CryptoBox {
    pub fn new(keys: KeyMaterial) -> Self {
        let mut material = b"verijoin-mac".to_vec();
        material.extend_from_slice(&keys.aes_key);
        material.extend_from_slice(&keys.hash_key);
        let mut mac_key = [0u8; HMAC_BLOCK_SIZE];
        mac_key[..TAG_SIZE].copy_from_slice(&digest(Algorithm::SHA256, &material));
        Self { keys, mac_key }
    }

    fn tag(&self, cipher: &[u8]) -> Vec<u8> {
        let mut inner: Vec<u8> = self.mac_key.iter().map(|b| b ^ 0x36).collect();
        inner.extend_from_slice(&self.keys.iv);
        inner.extend_from_slice(cipher);
        let mut outer: Vec<u8> = self.mac_key.iter().map(|b| b ^ 0x5c).collect();
        outer.extend(digest(Algorithm::SHA256, &inner));
        digest(Algorithm::SHA256, &outer)
    }

    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub fn encrypt(&self, plain: &str) -> String {
        let cipher = Aes256CbcEnc::new(&self.keys.aes_key.into(), &self.keys.iv.into());
        let mut bytes = cipher.encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
        let tag = self.tag(&bytes);
        bytes.extend(tag);
        hex::encode(bytes)
    }

    pub fn decrypt(&self, cipher_text: &str) -> Result<String, CryptoError> {
        let bytes =
            hex::decode(cipher_text).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        if bytes.len() < AES_BLOCK_SIZE + TAG_SIZE || (bytes.len() - TAG_SIZE) % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::Length(bytes.len()));
        }
        let (body, tag) = bytes.split_at(bytes.len() - TAG_SIZE);
        if !bool::from(tag.ct_eq(self.tag(body).as_slice())) {
            return Err(CryptoError::Integrity);
        }
        let cipher = Aes256CbcDec::new(&self.keys.aes_key.into(), &self.keys.iv.into());
        let plain = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| CryptoError::Padding)?;
        String::from_utf8(plain).map_err(|_| CryptoError::Utf8)
    }

    pub fn keyed_hash(&self, text: &str) -> Vec<u8> {
        let mut bytes = self.keys.hash_key.to_vec();
        bytes.extend_from_slice(text.as_bytes());
        digest(Algorithm::SHA256, &bytes)
    }

    /// `h_k(text) mod inverse_p == 0`; the worker cannot evaluate it without
    /// the hash key.
    pub fn sampled(&self, text: &str, inverse_p: u64) -> bool {
        if inverse_p <= 1 {
            return true;
        }
        let h = self
            .keyed_hash(text)
            .iter()
            .take(8)
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);
        h % inverse_p == 0
    }
}
