//! Stateless proof-of-work tokens.
//!
//! Nothing here is stored. The expected token for a client is recomputed on
//! every request from the instance seed, the difficulty, the current time
//! bucket, the User-Agent and the client IP, so it rotates on its own once
//! per TTL.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// A SHA-256 hex digest has 64 characters; more zeros cannot be required.
pub const MAX_DIFFICULTY: u32 = 64;

/// Longest nonce accepted from a client (fits any `u64`).
const MAX_NONCE_LEN: usize = 20;

/// Per-instance secret. The raw random bytes are hashed once and dropped.
#[derive(Clone)]
pub struct Seed {
    key: HmacSha256,
}

impl Seed {
    /// Fresh seed from the OS random source.
    pub fn generate() -> Self {
        let mut material = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        Self::derive(&material)
    }

    /// Seed derived from fixed material.
    pub fn derive(material: &[u8]) -> Self {
        let digest = Sha256::digest(material);
        // Zero-padded to the block size, as HMAC does with short keys.
        let mut padded = hmac::digest::Key::<HmacSha256>::default();
        padded[..digest.len()].copy_from_slice(&digest);
        Self {
            key: <HmacSha256 as Mac>::new(&padded),
        }
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Seed(..)")
    }
}

/// `now` rounded down to a multiple of `ttl`, as a bucket number.
pub fn time_bucket(now: DateTime<Utc>, ttl: Duration) -> i64 {
    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
    now.timestamp().div_euclid(ttl_secs)
}

/// The cookie value a client must present to skip the challenge.
pub fn expected_token(
    seed: &Seed,
    difficulty: u32,
    bucket: i64,
    user_agent: &[u8],
    client_ip: IpAddr,
) -> String {
    let mut mac = seed.key.clone();
    mac.update(&difficulty.to_be_bytes());
    mac.update(&bucket.to_be_bytes());
    mac.update(user_agent);
    mac.update(&[0]);
    mac.update(client_ip.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The challenge string shown to the client: the first half of the token.
pub fn challenge_of(token: &str) -> &str {
    &token[..token.len() / 2]
}

/// Hex SHA-256 of `challenge ‖ nonce`.
pub fn solution_digest(challenge: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `nonce` solves `challenge` at `difficulty`.
pub fn verify_solution(challenge: &str, nonce: &str, difficulty: u32) -> bool {
    if nonce.is_empty() || nonce.len() > MAX_NONCE_LEN || !nonce.bytes().all(|b| b.is_ascii_digit())
    {
        return false;
    }
    let digest = solution_digest(challenge, nonce);
    let required = difficulty.min(MAX_DIFFICULTY) as usize;
    digest.bytes().take(required).all(|b| b == b'0')
}

/// Brute-force the smallest solving nonce.
pub fn solve(challenge: &str, difficulty: u32) -> u64 {
    (0u64..)
        .find(|nonce| verify_solution(challenge, &nonce.to_string(), difficulty))
        .unwrap_or(u64::MAX)
}
