//! Cryptographic primitives and key management.
//!
//! This module provides the symmetric ciphers, the RSA key slots and key
//! exchange payloads, secure on-disk key storage, passphrase hashing, and the
//! encrypted message envelope built from all of them.

pub mod asymmetric;
pub mod envelope;
pub mod keystore;
pub mod passphrase;
pub mod symmetric;

pub use asymmetric::{KeyRing, RsaSize};
pub use envelope::{Envelope, EnvelopeCipher};
pub use keystore::KeyStore;
pub use passphrase::PassphraseHash;
