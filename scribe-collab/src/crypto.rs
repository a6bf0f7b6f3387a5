//! The crypto collaborator interface.
//!
//! The engine never implements asymmetric crypto itself. The server is
//! handed a [`SessionCipher`] whose public half (`n`, `k` as base-36
//! strings) is published in the `welcome` packet; clients encrypt the
//! user-password channel against it through a [`PasswordEncryptor`]. What
//! this module does own is the cheap, well-specified part: the login token
//! and the salted SHA-1 login digests.

use rand::Rng;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Public half of the server's key pair, as announced in `welcome`.
/// The strings are base-36 renderings of the key integers and are opaque to
/// this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub n: String,
    pub k: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("ciphertext could not be decrypted: {0}")]
    Undecipherable(String),
}

/// Server-side key pair: publishes the public key and decrypts what clients
/// sent against it.
pub trait SessionCipher: Send {
    fn public_key(&self) -> &PublicKey;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

/// Client-side half: encrypts a plaintext against the server's published
/// key.
pub trait PasswordEncryptor: Send {
    fn encrypt(&self, key: &PublicKey, plaintext: &str) -> String;
}

/// Identity cipher for tests and trusted local sessions. Offers no secrecy;
/// the password channel travels as-is.
#[derive(Debug, Clone)]
pub struct PlainCipher {
    key: PublicKey,
}

impl PlainCipher {
    pub fn new() -> Self {
        Self {
            key: PublicKey { n: "0".into(), k: "0".into() },
        }
    }
}

impl Default for PlainCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCipher for PlainCipher {
    fn public_key(&self) -> &PublicKey {
        &self.key
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        Ok(ciphertext.to_string())
    }
}

impl PasswordEncryptor for PlainCipher {
    fn encrypt(&self, _key: &PublicKey, plaintext: &str) -> String {
        plaintext.to_string()
    }
}

/// Hex SHA-1 of `token || password`, the digest both login password checks
/// compare against.
pub fn login_digest(token: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(token.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// A fresh login token: 48 random bits rendered in base 36.
pub fn generate_token() -> String {
    let bits: u64 = rand::thread_rng().gen_range(0..(1u64 << 48));
    to_base36(bits)
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}
