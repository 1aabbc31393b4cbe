//! Per-destination session crypto.
//!
//! A [`CryptoSession`] holds a freshly generated symmetric session key bound
//! to one destination. The key travels to the server wrapped with an
//! ephemeral X25519 agreement against the destination public key and is
//! signed with the device Ed25519 key. Sync payloads are sealed with
//! ChaCha20-Poly1305 under the session key, each with a random nonce
//! prefixed to the ciphertext.
//!
//! ```text
//! wrapped key = ephemeral pub (32) | nonce (12) | AEAD(kek, session key) (48)
//! payload     = nonce (12) | AEAD(session key, plaintext)
//! kek         = SHA-256(label | X25519(ephemeral, destination) | ephemeral pub | destination pub)
//! ```

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Session key length in bytes
pub const SESSION_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const WRAP_LABEL: &[u8] = b"uplink session key wrap v1";

/// Crypto context errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong shape
    #[error("invalid {0} key")]
    InvalidKey(&'static str),

    /// Device public key does not belong to the device private key
    #[error("device public key does not match private key")]
    KeyMismatch,

    /// Sealing failed
    #[error("encryption failed")]
    Encrypt,

    /// Ciphertext is malformed or was tampered with
    #[error("decryption failed")]
    Decrypt,

    /// Signature does not verify
    #[error("signature verification failed")]
    Signature,
}

/// Encryption and signing state for one destination
pub struct CryptoSession {
    session_key: [u8; SESSION_KEY_LEN],
    cipher: ChaCha20Poly1305,
    destination: PublicKey,
    signing_key: SigningKey,
}

impl CryptoSession {
    /// Build a session with a fresh random key for `server_public_key`
    pub fn for_destination(
        server_public_key: &[u8],
        device_private_key: &[u8; 32],
        device_public_key: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let server_key: [u8; 32] = server_public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("destination"))?;

        let signing_key = SigningKey::from_bytes(device_private_key);
        if signing_key.verifying_key().to_bytes() != *device_public_key {
            return Err(CryptoError::KeyMismatch);
        }

        let mut session_key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut session_key);

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&session_key)),
            session_key,
            destination: PublicKey::from(server_key),
            signing_key,
        })
    }

    /// Session key wrapped so only the destination can recover it
    pub fn wrap_session_key(&self) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.destination);

        let kek = derive_kek(shared.as_bytes(), &ephemeral_public, &self.destination);
        let sealed = seal(&ChaCha20Poly1305::new(Key::from_slice(&kek)), &self.session_key)?;

        let mut wrapped = Vec::with_capacity(32 + sealed.len());
        wrapped.extend_from_slice(ephemeral_public.as_bytes());
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    /// Device signature over `data`
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    /// Seal a payload under the session key
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(&self.cipher, plaintext)
    }

    /// Open a payload sealed under the session key
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(&self.cipher, data)
    }
}

impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("destination", &self.destination.as_bytes()[..4].to_vec())
            .finish_non_exhaustive()
    }
}

/// Server-side counterpart of a [`CryptoSession`]
///
/// Recovers the session key from a CONNECT and speaks the same payload
/// encryption. Loopback peers in tests use it to stand in for an endpoint.
pub struct PeerCrypto {
    cipher: ChaCha20Poly1305,
}

impl PeerCrypto {
    /// Verify the device signature and unwrap the session key
    pub fn accept(
        server_secret: &StaticSecret,
        wrapped_key: &[u8],
        signature: &[u8],
        device_public_key: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(device_public_key)
            .map_err(|_| CryptoError::InvalidKey("device"))?;
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::Signature)?;
        verifying_key
            .verify(wrapped_key, &signature)
            .map_err(|_| CryptoError::Signature)?;

        if wrapped_key.len() != 32 + NONCE_LEN + SESSION_KEY_LEN + TAG_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (ephemeral, sealed) = wrapped_key.split_at(32);
        let mut ephemeral_bytes = [0u8; 32];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let ephemeral_public = PublicKey::from(ephemeral_bytes);

        let server_public = PublicKey::from(server_secret);
        let shared = server_secret.diffie_hellman(&ephemeral_public);
        let kek = derive_kek(shared.as_bytes(), &ephemeral_public, &server_public);

        let session_key = open(&ChaCha20Poly1305::new(Key::from_slice(&kek)), sealed)?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&session_key)),
        })
    }

    /// Seal a payload under the recovered session key
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(&self.cipher, plaintext)
    }

    /// Open a payload sealed by the device
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(&self.cipher, data)
    }
}

fn derive_kek(shared: &[u8; 32], ephemeral: &PublicKey, destination: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(WRAP_LABEL);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(destination.as_bytes());
    hasher.finalize().into()
}

fn seal(cipher: &ChaCha20Poly1305, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(cipher: &ChaCha20Poly1305, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}
