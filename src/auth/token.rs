//! Authorization-state token transform.
//!
//! The state parameter sent to the OAuth provider is a Fernet token
//! (`0x80 | timestamp | iv | AES-128-CBC ciphertext | HMAC-SHA256`, URL-safe
//! base64) whose plaintext is the JSON of [`StateClaims`]. The 32-byte key
//! splits into a signing half and an encryption half, as Fernet specifies.

use std::time::Duration;

use aes::Aes128;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use super::credential::IdentityKey;
use crate::error::TokenError;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 0x80;
const HEADER_LEN: usize = 1 + 8 + 16;
const TAG_LEN: usize = 32;
/// Tokens stamped this far in the future are still accepted.
const MAX_CLOCK_SKEW_SECS: u64 = 60;

/// Payload of an authorization-state token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateClaims {
    pub suspension_token: Uuid,
    pub identity_key: IdentityKey,
}

/// Encodes and decodes authorization-state tokens under one key.
#[derive(Clone)]
pub struct StateTokenCodec {
    signing_key: [u8; 16],
    encryption_key: [u8; 16],
    max_age: Option<Duration>,
}

impl std::fmt::Debug for StateTokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTokenCodec")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl StateTokenCodec {
    /// Build a codec from a URL-safe base64 encoded 32-byte key.
    pub fn from_base64_key(key: &str) -> Result<Self, TokenError> {
        let key = key.trim();
        let raw = URL_SAFE
            .decode(key)
            .or_else(|_| URL_SAFE_NO_PAD.decode(key))
            .map_err(|_| TokenError::InvalidKey("key is not URL-safe base64".to_string()))?;
        if raw.len() != 32 {
            return Err(TokenError::InvalidKey(format!(
                "key must decode to 32 bytes, got {}",
                raw.len()
            )));
        }

        let mut signing_key = [0u8; 16];
        let mut encryption_key = [0u8; 16];
        signing_key.copy_from_slice(&raw[..16]);
        encryption_key.copy_from_slice(&raw[16..]);

        Ok(Self {
            signing_key,
            encryption_key,
            max_age: None,
        })
    }

    /// Generate a fresh random key in the expected encoding.
    pub fn generate_key() -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        URL_SAFE.encode(raw)
    }

    /// Reject tokens older than `max_age` on decode.
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn encode(&self, claims: &StateClaims) -> Result<String, TokenError> {
        let plaintext = serde_json::to_vec(claims)?;
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        self.encrypt_at(&plaintext, unix_now(), iv)
    }

    pub fn decode(&self, token: &str) -> Result<StateClaims, TokenError> {
        let plaintext = self.decrypt_at(token, unix_now())?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn encrypt_at(&self, plaintext: &[u8], timestamp: u64, iv: [u8; 16]) -> Result<String, TokenError> {
        let cipher = Aes128CbcEnc::new_from_slices(&self.encryption_key, &iv)
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut data = Vec::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
        data.push(VERSION);
        data.extend_from_slice(&timestamp.to_be_bytes());
        data.extend_from_slice(&iv);
        data.extend_from_slice(&ciphertext);

        let tag = self.mac(&data)?.finalize().into_bytes();
        data.extend_from_slice(&tag);

        Ok(URL_SAFE.encode(data))
    }

    fn decrypt_at(&self, token: &str, now: u64) -> Result<Vec<u8>, TokenError> {
        let data = URL_SAFE
            .decode(token.trim())
            .or_else(|_| URL_SAFE_NO_PAD.decode(token.trim()))
            .map_err(|_| TokenError::Encoding)?;

        if data.len() < HEADER_LEN + 16 + TAG_LEN {
            return Err(TokenError::Malformed("token too short".to_string()));
        }
        if data[0] != VERSION {
            return Err(TokenError::Malformed(format!("unknown version {:#x}", data[0])));
        }

        let (signed, tag) = data.split_at(data.len() - TAG_LEN);
        self.mac(signed)?
            .verify_slice(tag)
            .map_err(|_| TokenError::BadSignature)?;

        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&signed[1..9]);
        let issued = u64::from_be_bytes(ts_bytes);
        if issued > now.saturating_add(MAX_CLOCK_SKEW_SECS) {
            return Err(TokenError::Malformed("token issued in the future".to_string()));
        }
        if let Some(max_age) = self.max_age {
            let age = Duration::from_secs(now.saturating_sub(issued));
            if age > max_age {
                return Err(TokenError::Expired { age, max_age });
            }
        }

        let iv = &signed[9..HEADER_LEN];
        let ciphertext = &signed[HEADER_LEN..];
        if ciphertext.len() % 16 != 0 {
            return Err(TokenError::Malformed("ciphertext is not block aligned".to_string()));
        }
        let cipher = Aes128CbcDec::new_from_slices(&self.encryption_key, iv)
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TokenError::Decrypt)
    }

    fn mac(&self, data: &[u8]) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        mac.update(data);
        Ok(mac)
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
