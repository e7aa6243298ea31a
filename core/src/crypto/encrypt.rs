// Per-network payload encryption: XChaCha20-Poly1305
//
// Flow:
// 1. Look up the 32-byte key of the network named in the `encoded` header
// 2. Generate a random 24-byte nonce
// 3. Encrypt with the network name bound as AAD
// 4. Output: nonce || ciphertext
//
// The integrity hash is a hex SHA-256 over the plaintext payload so that a
// receiver can validate after decryption.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ProtocolError;

/// XChaCha20 nonce length
pub const NONCE_LEN: usize = 24;

/// Symmetric payload key for one network
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PayloadKey([u8; 32]);

impl PayloadKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded 32-byte key
    pub fn from_hex(value: &str) -> Option<Self> {
        let mut bytes = hex::decode(value).ok()?;
        if bytes.len() != 32 {
            bytes.zeroize();
            return None;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Some(Self(key))
    }

    /// Fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadKey(..)")
    }
}

/// Encrypt a payload for `network`
pub fn seal_payload(
    key: &PayloadKey,
    network: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| ProtocolError::Cipher(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: network.as_bytes(),
            },
        )
        .map_err(|e| ProtocolError::Cipher(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a payload sealed by [`seal_payload`]
pub fn open_payload(
    key: &PayloadKey,
    network: &str,
    sealed: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if sealed.len() < NONCE_LEN {
        return Err(ProtocolError::Cipher("sealed payload shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| ProtocolError::Cipher(e.to_string()))?;

    cipher
        .decrypt(
            XNonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: network.as_bytes(),
            },
        )
        .map_err(|_| ProtocolError::Cipher("decryption failed: wrong key or tampered payload".into()))
}

/// Printable integrity hash of a payload
pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}
