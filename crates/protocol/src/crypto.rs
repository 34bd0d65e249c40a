//! Key exchange and per-message authenticated encryption.
//!
//! The browser extension and the bridge negotiate a session through an
//! unencrypted public-key exchange, after which every message body is a
//! NaCl box (X25519 + XSalsa20-Poly1305) under the pair (own secret key,
//! peer public key) with a caller-supplied 24-byte nonce. Keys, nonces and
//! ciphertexts travel base64-encoded inside JSON envelopes.
//!
//! A [`Session`] is immutable: it is created whole by a successful key
//! exchange and replaced whole by the next one, so there is no window where
//! the peer key and the local key pair disagree.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crypto_box::aead::{Aead, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;

use crate::error::{ProtocolError, Result};

/// Length of a nonce in bytes.
pub const NONCE_LENGTH: usize = 24;

/// Length of a public or secret key in bytes.
pub const KEY_LENGTH: usize = 32;

/// A fixed-width per-message nonce.
///
/// The response to a request always carries `increment(request nonce)`;
/// the request nonce itself is never reused in the other direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LENGTH]);

impl Nonce {
    /// Generates a fresh random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a nonce from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Decodes a base64 nonce, validating its width.
    pub fn from_b64(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded)?;
        let bytes: [u8; NONCE_LENGTH] = bytes.try_into().map_err(|v: Vec<u8>| {
            ProtocolError::InvalidNonce(format!(
                "expected {} bytes, got {}",
                NONCE_LENGTH,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Encodes the nonce as base64 for transport.
    pub fn to_b64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Returns the raw bytes of this nonce.
    pub fn as_bytes(&self) -> &[u8; NONCE_LENGTH] {
        &self.0
    }

    /// Returns the nonce treated as a little-endian integer plus one,
    /// wrapping at the fixed width.
    ///
    /// This must match the extension's convention bit for bit; it is used
    /// to derive every response nonce.
    pub fn increment(&self) -> Self {
        let mut bytes = self.0;
        let mut carry = 1u16;
        for byte in bytes.iter_mut() {
            let sum = u16::from(*byte) + carry;
            *byte = (sum & 0xff) as u8;
            carry = sum >> 8;
            if carry == 0 {
                break;
            }
        }
        Self(bytes)
    }
}

/// The bridge's own key pair, generated once per process start.
///
/// A restart therefore invalidates all previously negotiated sessions and
/// forces connected extensions to re-run the key exchange.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a new random key pair using the OS entropy source.
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Returns the public key encoded as base64 for the handshake reply.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_b64())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// An established encryption session with one extension client.
///
/// Holds the key material; the box cipher is derived per call so the value
/// stays cheap to clone into deferred-response handles.
#[derive(Clone)]
pub struct Session {
    client_public_key_b64: String,
    own_public_key_b64: String,
    own_secret: SecretKey,
    peer_public: PublicKey,
}

impl Session {
    /// Establishes a session from the bridge's key pair and the client's
    /// base64 public key, deriving the shared-secret cipher.
    ///
    /// Fails if the peer key is empty, not valid base64, or the wrong width.
    pub fn establish(own: &KeyPair, client_public_key_b64: &str) -> Result<Self> {
        if client_public_key_b64.is_empty() {
            return Err(ProtocolError::InvalidPublicKey("empty peer key".into()));
        }

        let peer_bytes = BASE64
            .decode(client_public_key_b64)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        let peer_bytes: [u8; KEY_LENGTH] = peer_bytes.try_into().map_err(|v: Vec<u8>| {
            ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                v.len()
            ))
        })?;

        Ok(Self {
            client_public_key_b64: client_public_key_b64.to_string(),
            own_public_key_b64: own.public_key_b64(),
            own_secret: own.secret.clone(),
            peer_public: PublicKey::from(peer_bytes),
        })
    }

    fn cipher(&self) -> SalsaBox {
        SalsaBox::new(&self.peer_public, &self.own_secret)
    }

    /// The client's public key as received in the handshake.
    pub fn client_public_key(&self) -> &str {
        &self.client_public_key_b64
    }

    /// The bridge's public key for this session.
    pub fn own_public_key(&self) -> &str {
        &self.own_public_key_b64
    }

    /// Encrypts a JSON value under `nonce`, returning base64 ciphertext.
    ///
    /// Deterministic for identical inputs: the nonce is supplied by the
    /// caller, not drawn here.
    pub fn encrypt_json(&self, value: &serde_json::Value, nonce: &Nonce) -> Result<String> {
        let plaintext = serde_json::to_vec(value)?;
        let ciphertext = self
            .cipher()
            .encrypt(
                crypto_box::Nonce::from_slice(nonce.as_bytes()),
                plaintext.as_slice(),
            )
            .map_err(|_| ProtocolError::Encryption("box seal failed".into()))?;
        Ok(BASE64.encode(ciphertext))
    }

    /// Decrypts base64 ciphertext under a base64 nonce into a JSON value.
    ///
    /// Any failure (bad base64, wrong nonce width, authentication failure,
    /// non-JSON plaintext) is an error, never a panic; the caller degrades
    /// to a client-visible error reply.
    pub fn decrypt_json(
        &self,
        ciphertext_b64: &str,
        nonce_b64: &str,
    ) -> Result<serde_json::Value> {
        let nonce = Nonce::from_b64(nonce_b64)?;
        let ciphertext = BASE64.decode(ciphertext_b64)?;
        let plaintext = self
            .cipher()
            .decrypt(
                crypto_box::Nonce::from_slice(nonce.as_bytes()),
                ciphertext.as_slice(),
            )
            .map_err(|_| ProtocolError::Decryption("box open failed".into()))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_public_key", &self.client_public_key_b64)
            .field("own_public_key", &self.own_public_key_b64)
            .field("own_secret", &"[REDACTED]")
            .finish()
    }
}
