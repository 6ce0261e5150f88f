//! Passphrase verification strings.
//!
//! A passphrase is never stored. What is stored is
//! `$10$<base64 salt>$<iterations>$<base64 hash>`, where the hash is
//! PBKDF2-HMAC-SHA1 over the passphrase. The salt length, iteration count
//! and output length are compatibility constants shared with existing
//! configuration files.
//!
//! The same salt and iteration count also derive the secret that protects
//! the private key files. It is the second 16-byte PBKDF2 block, so the
//! stored hash (the first block) reveals nothing about it.

use crate::utils::{IpmsgError, Result};
use base64::{engine::general_purpose, Engine};
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use std::fmt;
use zeroize::Zeroizing;

/// Scheme tag at the start of the hash string
pub const PASSPHRASE_SCHEME: &str = "10";

/// PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Salt length in bytes
pub const SALT_LEN: usize = 8;

/// Derived hash length in bytes
pub const DERIVED_KEY_LEN: usize = 16;

/// Fill `out` with PBKDF2-HMAC-SHA1 output
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    pbkdf2::pbkdf2_hmac::<Sha1>(passphrase, salt, iterations, out);
}

/// A parsed passphrase verification string
#[derive(Clone, PartialEq, Eq)]
pub struct PassphraseHash {
    salt: Vec<u8>,
    iterations: u32,
    hash: [u8; DERIVED_KEY_LEN],
}

impl fmt::Debug for PassphraseHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassphraseHash")
            .field("iterations", &self.iterations)
            .field("hash", &"[REDACTED]")
            .finish()
    }
}

impl PassphraseHash {
    /// Hash `passphrase` with a fresh random salt
    pub fn new(passphrase: &str) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(passphrase, salt, PBKDF2_ITERATIONS)
    }

    /// Hash `passphrase` with an explicit salt and iteration count
    pub fn with_salt(passphrase: &str, salt: Vec<u8>, iterations: u32) -> Self {
        let mut hash = [0u8; DERIVED_KEY_LEN];
        derive_key(passphrase.as_bytes(), &salt, iterations, &mut hash);
        Self {
            salt,
            iterations,
            hash,
        }
    }

    /// Parse a `$10$salt$iterations$hash` string
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the scheme, field count or hash length is wrong.
    pub fn parse(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split('$').collect();
        let [empty, scheme, salt, iterations, hash] = fields.as_slice() else {
            return Err(IpmsgError::invalid_argument("passphrase hash needs 4 fields"));
        };
        if !empty.is_empty() || *scheme != PASSPHRASE_SCHEME {
            return Err(IpmsgError::invalid_argument(format!(
                "unsupported passphrase scheme {scheme:?}"
            )));
        }
        let salt = general_purpose::STANDARD.decode(salt)?;
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| IpmsgError::invalid_argument("passphrase iteration count"))?;
        if iterations == 0 {
            return Err(IpmsgError::invalid_argument("passphrase iteration count is zero"));
        }
        let hash: [u8; DERIVED_KEY_LEN] = general_purpose::STANDARD
            .decode(hash)?
            .try_into()
            .map_err(|_| IpmsgError::invalid_argument("passphrase hash length"))?;
        Ok(Self {
            salt,
            iterations,
            hash,
        })
    }

    /// Check `passphrase` against the stored hash in constant time
    pub fn verify(&self, passphrase: &str) -> bool {
        let mut candidate = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
        derive_key(passphrase.as_bytes(), &self.salt, self.iterations, &mut *candidate);
        candidate
            .iter()
            .zip(self.hash.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Hex-encoded PBKDF2 key that encrypts the private key files.
    ///
    /// Only meaningful after [`PassphraseHash::verify`] accepted
    /// `passphrase`.
    pub fn key_file_secret(&self, passphrase: &str) -> Zeroizing<String> {
        let mut derived = Zeroizing::new([0u8; 2 * DERIVED_KEY_LEN]);
        derive_key(passphrase.as_bytes(), &self.salt, self.iterations, &mut *derived);
        Zeroizing::new(hex::encode(&derived[DERIVED_KEY_LEN..]))
    }

    /// Iteration count recorded in the string
    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl fmt::Display for PassphraseHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "${}${}${}${}",
            PASSPHRASE_SCHEME,
            general_purpose::STANDARD.encode(&self.salt),
            self.iterations,
            general_purpose::STANDARD.encode(self.hash)
        )
    }
}
