// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Challenge-response authentication.
//!
//! ```text
//! Client                                   Server
//!    |--- HandshakeRequest(modules) ---------->| key <- 32 random bytes
//!    |<-- HandshakeResponse(key) --------------|
//!    | tag = HMAC-SHA256(key, transcript)      |
//!    |--- StartRequest(tag) ------------------>| constant-time verify
//!    |<-- StartResponse -----------------------|
//! ```
//!
//! The transcript is the concatenation of `name + " " + version + " " +
//! build_hash` for every claimed module, in handshake order, with no
//! separator between modules.

use super::protocol::{ModuleInfo, KEY_SIZE, TAG_SIZE};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

/// A 32-byte key issued to exactly one handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Draw a fresh key from the system CSPRNG.
    pub fn generate(rng: &SystemRandom) -> Result<Self, AuthError> {
        let mut key = [0u8; KEY_SIZE];
        rng.fill(&mut key).map_err(|_| AuthError::KeyGeneration)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Build the byte string the tag is computed over.
pub fn transcript(modules: &[ModuleInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(modules.iter().map(|m| m.encoded_len()).sum());
    for module in modules {
        out.extend_from_slice(module.to_string().as_bytes());
    }
    out
}

/// Compute the tag a client must present for `modules` under `key`.
pub fn compute_tag(key: &[u8; KEY_SIZE], modules: &[ModuleInfo]) -> [u8; TAG_SIZE] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, &transcript(modules));
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Server-side expectation for one handshake.
pub struct Challenge {
    key: hmac::Key,
    transcript: Vec<u8>,
}

impl Challenge {
    pub fn new(key: &SessionKey, modules: &[ModuleInfo]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes()),
            transcript: transcript(modules),
        }
    }

    /// Constant-time check of a client tag.
    pub fn verify(&self, tag: &[u8]) -> bool {
        hmac::verify(&self.key, &self.transcript, tag).is_ok()
    }
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenge")
            .field("transcript_len", &self.transcript.len())
            .finish_non_exhaustive()
    }
}

/// Authentication error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("System RNG failed to generate a session key")]
    KeyGeneration,
}
