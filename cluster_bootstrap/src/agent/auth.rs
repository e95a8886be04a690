/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Pre-shared key authentication for agent connections.
//!
//! The agent opens every connection with a challenge frame
//! (`#CHALLENGE#` followed by a random nonce). The client answers with
//! `SHA-256(key || nonce)`, and the agent replies with `#WELCOME#` or
//! `#FAILURE#`. The key itself never crosses the wire.

use sha2::Digest;
use sha2::Sha256;

pub(crate) const CHALLENGE: &[u8] = b"#CHALLENGE#";
pub(crate) const WELCOME: &[u8] = b"#WELCOME#";
pub(crate) const FAILURE: &[u8] = b"#FAILURE#";

const NONCE_LEN: usize = 32;

/// Length of a client's answer to a challenge (a SHA-256 digest).
pub(crate) const RESPONSE_LEN: usize = 32;

/// A shared secret known to both the orchestrator and the agent.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey(Vec<u8>);

impl AuthKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    pub(crate) fn digest(&self, nonce: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.0);
        hasher.update(nonce);
        hasher.finalize().to_vec()
    }

    /// Check a client's response to `nonce` in constant time.
    pub(crate) fn verify(&self, nonce: &[u8], response: &[u8]) -> bool {
        let expected = self.digest(nonce);
        expected.len() == response.len()
            && expected
                .iter()
                .zip(response)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthKey(<redacted>)")
    }
}

impl From<&str> for AuthKey {
    fn from(key: &str) -> Self {
        Self::new(key.as_bytes())
    }
}

impl From<String> for AuthKey {
    fn from(key: String) -> Self {
        Self::new(key.into_bytes())
    }
}

/// A fresh challenge frame and the nonce it carries.
pub(crate) fn challenge() -> (Vec<u8>, Vec<u8>) {
    let nonce: [u8; NONCE_LEN] = rand::random();
    let mut frame = CHALLENGE.to_vec();
    frame.extend_from_slice(&nonce);
    (frame, nonce.to_vec())
}

/// Extract the nonce from a challenge frame.
pub(crate) fn parse_challenge(frame: &[u8]) -> Option<&[u8]> {
    frame.strip_prefix(CHALLENGE).filter(|nonce| !nonce.is_empty())
}
