//! KLAP hashing and session cipher.
//!
//! The handshake proves both sides know the same auth hash without sending it:
//!
//! - `auth_hash = sha256(sha1(username) + sha1(password))`
//! - handshake1 server proof: `sha256(local_seed + remote_seed + auth_hash)`
//! - handshake2 client proof: `sha256(remote_seed + local_seed + auth_hash)`
//!
//! Once both seeds are known, the session keys are a pure function of
//! `(local_seed, remote_seed, auth_hash)`:
//!
//! - key: `sha256("lsk" + seeds + auth_hash)[..16]`
//! - iv: `sha256("iv" + seeds + auth_hash)`, first 12 bytes are the fixed IV
//!   prefix, last 4 bytes (big-endian `i32`) the initial sequence number
//! - signature key: `sha256("ldk" + seeds + auth_hash)[..28]`
//!
//! Each request bumps the sequence number, uses `iv_prefix + be32(seq)` as the
//! AES-128-CBC IV and prepends `sha256(sig_key + be32(seq) + ciphertext)`.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::Credentials;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Length of the local and remote handshake seeds.
pub const SEED_LEN: usize = 16;

/// Length of the auth hash and of every handshake proof.
pub const HASH_LEN: usize = 32;

/// Length of the signature prefix on every encrypted payload.
pub const SIGNATURE_LEN: usize = 32;

/// 32-byte credential digest.
pub type AuthHash = [u8; HASH_LEN];

/// Derives the auth hash for a set of credentials.
///
/// `sha256(sha1(username) + sha1(password))`, with the username used as-is.
pub fn generate_auth_hash(credentials: &Credentials) -> AuthHash {
    let username = Sha1::digest(credentials.username.as_bytes());
    let password = Sha1::digest(credentials.expose_password().as_bytes());

    Sha256::new()
        .chain_update(username)
        .chain_update(password)
        .finalize()
        .into()
}

/// Expected server proof returned in the handshake1 response.
pub fn handshake1_seed_auth_hash(
    local_seed: &[u8; SEED_LEN],
    remote_seed: &[u8; SEED_LEN],
    auth_hash: &AuthHash,
) -> [u8; HASH_LEN] {
    sha256(&[local_seed, remote_seed, auth_hash])
}

/// Client proof sent as the handshake2 body.
pub fn handshake2_seed_auth_hash(
    local_seed: &[u8; SEED_LEN],
    remote_seed: &[u8; SEED_LEN],
    auth_hash: &AuthHash,
) -> [u8; HASH_LEN] {
    sha256(&[remote_seed, local_seed, auth_hash])
}

fn sha256(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Key material derived once per handshake. Never changes afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKeys {
    key: [u8; 16],
    iv_prefix: [u8; 12],
    initial_seq: i32,
    signature_key: [u8; 28],
}

impl CipherKeys {
    /// Derives key, IV prefix, initial sequence and signature key.
    pub fn derive(
        local_seed: &[u8; SEED_LEN],
        remote_seed: &[u8; SEED_LEN],
        auth_hash: &AuthHash,
    ) -> Self {
        let lsk = sha256(&[b"lsk", local_seed, remote_seed, auth_hash]);
        let iv = sha256(&[b"iv", local_seed, remote_seed, auth_hash]);
        let ldk = sha256(&[b"ldk", local_seed, remote_seed, auth_hash]);

        let mut key = [0u8; 16];
        key.copy_from_slice(&lsk[..16]);

        let mut iv_prefix = [0u8; 12];
        iv_prefix.copy_from_slice(&iv[..12]);
        let initial_seq = i32::from_be_bytes([iv[12], iv[13], iv[14], iv[15]]);

        let mut signature_key = [0u8; 28];
        signature_key.copy_from_slice(&ldk[..28]);

        Self {
            key,
            iv_prefix,
            initial_seq,
            signature_key,
        }
    }

    /// Sequence number the first request increments from.
    pub fn initial_seq(&self) -> i32 {
        self.initial_seq
    }

    fn iv(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv_prefix);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    /// Signature over a ciphertext for the given sequence number.
    pub fn signature(&self, seq: i32, ciphertext: &[u8]) -> [u8; SIGNATURE_LEN] {
        sha256(&[&self.signature_key, &seq.to_be_bytes(), ciphertext])
    }

    /// Encrypts and signs `plaintext` under `seq` without touching any counter.
    ///
    /// Returns `signature + ciphertext`.
    pub fn seal(&self, plaintext: &[u8], seq: i32) -> Vec<u8> {
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv(seq).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut payload = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        payload.extend_from_slice(&self.signature(seq, &ciphertext));
        payload.extend_from_slice(&ciphertext);
        payload
    }

    /// Decrypts `signature + ciphertext` sealed under `seq`.
    ///
    /// The signature prefix is skipped, not verified.
    pub fn open(&self, payload: &[u8], seq: i32) -> Result<Vec<u8>, CipherError> {
        if payload.len() < SIGNATURE_LEN {
            return Err(CipherError::PayloadTooShort(payload.len()));
        }

        Aes128CbcDec::new(&self.key.into(), &self.iv(seq).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&payload[SIGNATURE_LEN..])
            .map_err(|_| CipherError::BadPadding)
    }
}

impl std::fmt::Debug for CipherKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKeys")
            .field("key", &"[REDACTED]")
            .field("initial_seq", &self.initial_seq)
            .finish()
    }
}

/// Per-session cipher state: immutable keys plus the sequence counter.
///
/// The counter only moves forward (wrapping at the `i32` boundary) and is
/// only reset by building a new context from a fresh handshake.
#[derive(Debug, Clone)]
pub struct CipherContext {
    keys: CipherKeys,
    seq: i32,
}

impl CipherContext {
    /// Creates a cipher context from the handshake seeds and auth hash.
    pub fn new(
        local_seed: &[u8; SEED_LEN],
        remote_seed: &[u8; SEED_LEN],
        auth_hash: &AuthHash,
    ) -> Self {
        Self::from_keys(CipherKeys::derive(local_seed, remote_seed, auth_hash))
    }

    /// Creates a cipher context from already-derived keys.
    pub fn from_keys(keys: CipherKeys) -> Self {
        let seq = keys.initial_seq();
        Self { keys, seq }
    }

    /// Increments the sequence number and encrypts `plaintext` under it.
    ///
    /// Returns the wire payload and the sequence number that must be sent
    /// alongside it and later passed to [`decrypt`](Self::decrypt).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> (Vec<u8>, i32) {
        self.seq = self.seq.wrapping_add(1);
        (self.keys.seal(plaintext, self.seq), self.seq)
    }

    /// Decrypts a response to the request that was sent with `seq`.
    pub fn decrypt(&self, payload: &[u8], seq: i32) -> Result<Vec<u8>, CipherError> {
        self.keys.open(payload, seq)
    }

    /// The most recently used sequence number.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// The derived key material.
    pub fn keys(&self) -> &CipherKeys {
        &self.keys
    }

    #[cfg(test)]
    pub(crate) fn with_seq(mut self, seq: i32) -> Self {
        self.seq = seq;
        self
    }
}

/// Error type for KLAP cipher operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Payload shorter than the signature prefix.
    PayloadTooShort(usize),
    /// PKCS#7 padding check failed after decryption.
    BadPadding,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooShort(len) => write!(f, "payload too short: {} bytes", len),
            Self::BadPadding => write!(f, "bad padding"),
        }
    }
}

impl std::error::Error for CipherError {}
