//! Deterministic key digests and their fixed-alphabet encoding.
//!
//! `set` and `get` must independently derive the same primary key for the
//! same input key, so the digest is a pure function of the key text plus an
//! optional secret fixed at store construction. Nothing here varies between
//! calls.

use std::fmt;

use sha3::{Digest, Sha3_256};

/// The 64-symbol primary-key alphabet: digits, lowercase, uppercase, hyphen,
/// underscore. The partition map classifies exactly these symbols.
pub const ALPHABET: &[u8; 64] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-_";

/// Length of an encoded primary key: 32 digest bytes in 6-bit groups.
pub const PRIMARY_KEY_LEN: usize = 43;

/// Produces primary keys from key text. Cheap to clone and freely shared;
/// holds no mutable state.
#[derive(Clone, Default)]
pub struct KeyHasher {
    secret: Vec<u8>,
}

impl KeyHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hasher that mixes a fixed per-store secret into every digest. Two
    /// stores with different secrets place the same key in different slots.
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// SHA3-256 over `secret || key`. Deterministic: equal inputs always
    /// yield equal digests.
    pub fn digest(&self, key: &str) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        hasher.update(&self.secret);
        hasher.update(key.as_bytes());
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        out
    }

    /// Digest the key and encode it over [`ALPHABET`]. The first character of
    /// the result is the routing symbol.
    pub fn primary_key(&self, key: &str) -> PrimaryKey {
        PrimaryKey(encode(&self.digest(key)))
    }
}

impl fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak the secret.
        f.debug_struct("KeyHasher")
            .field("secret_len", &self.secret.len())
            .finish()
    }
}

/// A content-derived, fixed-alphabet identifier. Used both as the storage key
/// and as the routing input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimaryKey(String);

impl PrimaryKey {
    /// The character that drives shard/table routing.
    pub fn leading_symbol(&self) -> char {
        // Encoded keys are never empty; the alphabet is ASCII.
        self.0.as_bytes()[0] as char
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encode bytes as big-endian 6-bit groups over [`ALPHABET`]. Trailing bits
/// are zero-padded, base64-style.
fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(6));
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &b in bytes {
        acc = (acc << 8) | b as u32;
        bits += 8;
        while bits >= 6 {
            bits -= 6;
            out.push(ALPHABET[(acc >> bits) as usize & 0x3f] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((acc << (6 - bits)) & 0x3f) as usize] as char);
    }
    out
}
