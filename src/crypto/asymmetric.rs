//! RSA key slots, public key exchange and signatures.
//!
//! A process holds up to three RSA key pairs (512, 1024 and 2048 bits). Each
//! one is advertised through a capability bit; peers pick the strongest size
//! both sides support for wrapping session keys.

use crate::crypto::keystore::KeyStore;
use crate::crypto::symmetric::SUPPORTED_SYMMETRIC;
use crate::transport::codec::{bin_to_hex, hex_to_bin};
use crate::transport::protocol::crypto_cap::{
    ASYMMETRIC_MASK, RSA_1024, RSA_2048, RSA_512, SIGNATURE_MASK, SIGN_MD5, SIGN_SHA1,
};
use crate::utils::{CryptoError, IpmsgError, KeyStoreError, ProtocolError, Result};
use md5::Md5;
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use zeroize::Zeroizing;

/// Public exponent every generated key must carry
pub const RSA_PUBLIC_EXPONENT: u32 = 65_537;

/// Attempts per slot before key generation is reported as failed
pub const KEY_GENERATION_ATTEMPTS: usize = 3;

/// The three RSA sizes the protocol knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RsaSize {
    /// 512-bit modulus
    Rsa512,
    /// 1024-bit modulus
    Rsa1024,
    /// 2048-bit modulus
    Rsa2048,
}

impl RsaSize {
    /// Strongest first
    pub const BY_STRENGTH: [RsaSize; 3] = [RsaSize::Rsa2048, RsaSize::Rsa1024, RsaSize::Rsa512];

    /// Modulus length in bits
    pub fn bits(self) -> usize {
        match self {
            Self::Rsa512 => 512,
            Self::Rsa1024 => 1024,
            Self::Rsa2048 => 2048,
        }
    }

    /// Capability bit advertising this size
    pub fn capability(self) -> u32 {
        match self {
            Self::Rsa512 => RSA_512,
            Self::Rsa1024 => RSA_1024,
            Self::Rsa2048 => RSA_2048,
        }
    }

    /// Size for exactly one asymmetric capability bit
    pub fn from_capability(cap: u32) -> Option<Self> {
        Self::BY_STRENGTH.into_iter().find(|size| size.capability() == cap)
    }

    /// Size matching a modulus length
    pub fn from_bits(bits: usize) -> Option<Self> {
        Self::BY_STRENGTH.into_iter().find(|size| size.bits() == bits)
    }
}

impl fmt::Display for RsaSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RSA-{}", self.bits())
    }
}

/// The local RSA key slots.
///
/// Populated once at startup and read-only afterwards, so it is shared
/// through an `Arc` without a lock.
pub struct KeyRing {
    slots: Vec<(RsaSize, RsaPrivateKey)>,
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("sizes", &self.sizes())
            .finish_non_exhaustive()
    }
}

impl KeyRing {
    /// Load every requested slot from `store`, generating and persisting the
    /// ones that do not exist yet.
    ///
    /// # Errors
    ///
    /// Key store failures other than a missing file are returned as is; the
    /// caller treats them as fatal. Generation failures surface as
    /// `CryptoBackendError`.
    pub fn init_keys(store: &KeyStore, sizes: &[RsaSize], passphrase: Option<&str>) -> Result<Self> {
        let mut slots = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let key = match store.load_private_key(size.bits(), passphrase) {
                Ok(key) => {
                    check_key(&key, size).map_err(|e| KeyStoreError::Corrupt {
                        path: store.private_key_path(size.bits()).display().to_string(),
                        reason: e.to_string(),
                    })?;
                    log::debug!("Loaded {size} key from {}", store.dir().display());
                    key
                }
                Err(IpmsgError::KeyStore(KeyStoreError::NotFound { .. })) => {
                    log::info!("Generating {size} key");
                    let key = generate_key(size)?;
                    store.save_key_pair(size.bits(), &key, passphrase)?;
                    key
                }
                Err(e) => return Err(e),
            };
            slots.push((size, key));
        }
        Ok(Self::from_keys(slots))
    }

    /// Fresh in-memory keys, nothing persisted
    ///
    /// # Errors
    ///
    /// `CryptoBackendError` if generation keeps failing.
    pub fn generate(sizes: &[RsaSize]) -> Result<Self> {
        let slots = sizes
            .iter()
            .map(|&size| generate_key(size).map(|key| (size, key)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_keys(slots))
    }

    /// Wrap already loaded keys
    pub fn from_keys(mut slots: Vec<(RsaSize, RsaPrivateKey)>) -> Self {
        slots.sort_by_key(|(size, _)| std::cmp::Reverse(*size));
        slots.dedup_by_key(|(size, _)| *size);
        Self { slots }
    }

    /// Sizes present, strongest first
    pub fn sizes(&self) -> Vec<RsaSize> {
        self.slots.iter().map(|(size, _)| *size).collect()
    }

    /// Private key for a size
    pub fn key(&self, size: RsaSize) -> Option<&RsaPrivateKey> {
        self.slots
            .iter()
            .find(|(slot, _)| *slot == size)
            .map(|(_, key)| key)
    }

    /// Asymmetric capability bits of the loaded slots
    pub fn asymmetric_capability(&self) -> u32 {
        self.slots
            .iter()
            .fold(0, |cap, (size, _)| cap | size.capability())
    }

    /// Full crypto capability word advertised to peers
    pub fn local_capability(&self) -> u32 {
        self.asymmetric_capability() | SUPPORTED_SYMMETRIC | SIGN_MD5 | SIGN_SHA1
    }

    fn key_for_cap(&self, asym_cap: u32) -> Result<&RsaPrivateKey> {
        RsaSize::from_capability(asym_cap)
            .and_then(|size| self.key(size))
            .ok_or_else(|| CryptoError::MissingLocalKey { cap: asym_cap }.into())
    }

    /// Reply payload for a peer's GETPUBKEY: `<local cap>:<e>-<n>`, using
    /// the strongest slot the peer also supports.
    ///
    /// # Errors
    ///
    /// `NotFound` if no RSA size is common.
    pub fn generate_anspubkey_message(&self, peer_cap: u32) -> Result<String> {
        let size = select_asymmetric_key(peer_cap, self.asymmetric_capability())?;
        let key = self.key_for_cap(size.capability())?;
        Ok(format!(
            "{:x}:{}-{}",
            self.local_capability(),
            bin_to_hex(&key.e().to_bytes_be()),
            bin_to_hex(&key.n().to_bytes_be())
        ))
    }

    /// Decrypt a session key wrapped for the slot named by `asym_cap`
    ///
    /// # Errors
    ///
    /// `NotFound` without a matching slot, `InvalidArgument` on bad hex,
    /// `CryptoBackendError` if RSA decryption fails.
    pub fn unwrap_session_key(&self, asym_cap: u32, hex_ciphertext: &str) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.key_for_cap(asym_cap)?;
        let ciphertext = hex_to_bin(hex_ciphertext)?;
        key.decrypt_blinded(&mut OsRng, Pkcs1v15Encrypt, &ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| {
                CryptoError::Decryption {
                    reason: format!("session key: {e}"),
                }
                .into()
            })
    }

    /// Sign `message` with the slot named by `asym_cap`
    ///
    /// # Errors
    ///
    /// `NotFound` without a matching slot or for an unknown `sign_type`,
    /// `CryptoBackendError` if signing fails.
    pub fn sign(&self, asym_cap: u32, sign_type: u32, message: &[u8]) -> Result<String> {
        let key = self.key_for_cap(asym_cap)?;
        let signature = match sign_type {
            SIGN_SHA1 => key.sign_with_rng(&mut OsRng, Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(message)),
            SIGN_MD5 => key.sign_with_rng(&mut OsRng, Pkcs1v15Sign::new::<Md5>(), &Md5::digest(message)),
            other => return Err(CryptoError::UnknownCapability { cap: other }.into()),
        }
        .map_err(|e| CryptoError::Signing {
            reason: e.to_string(),
        })?;
        Ok(bin_to_hex(&signature))
    }
}

fn check_key(key: &RsaPrivateKey, size: RsaSize) -> Result<()> {
    key.validate().map_err(|e| CryptoError::InvalidKey {
        reason: e.to_string(),
    })?;
    if key.n().bits() != size.bits() {
        return Err(CryptoError::InvalidKey {
            reason: format!("modulus has {} bits, expected {}", key.n().bits(), size.bits()),
        }
        .into());
    }
    if *key.e() != BigUint::from(RSA_PUBLIC_EXPONENT) {
        return Err(CryptoError::InvalidKey {
            reason: "unexpected public exponent".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Generate one key, retrying when the result fails validation
///
/// # Errors
///
/// `CryptoBackendError` after [`KEY_GENERATION_ATTEMPTS`] failures.
pub fn generate_key(size: RsaSize) -> Result<RsaPrivateKey> {
    let mut last_error = String::new();
    for attempt in 1..=KEY_GENERATION_ATTEMPTS {
        match RsaPrivateKey::new(&mut OsRng, size.bits()) {
            Ok(key) => match check_key(&key, size) {
                Ok(()) => return Ok(key),
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }
        log::warn!("{size} key generation attempt {attempt} failed: {last_error}");
    }
    Err(CryptoError::KeyGeneration { reason: last_error }.into())
}

/// Strongest RSA size both capability words contain
///
/// # Errors
///
/// `NotFound` if none is common.
pub fn select_asymmetric_key(peer_cap: u32, local_cap: u32) -> Result<RsaSize> {
    let common = peer_cap & local_cap & ASYMMETRIC_MASK;
    RsaSize::BY_STRENGTH
        .into_iter()
        .find(|size| common & size.capability() != 0)
        .ok_or_else(|| {
            CryptoError::NoCommonCapability {
                what: "asymmetric",
                peer_cap,
                local_cap,
            }
            .into()
        })
}

/// Signature algorithm both sides support: MD5 first when `prefer_speed`,
/// SHA1 first otherwise.
///
/// # Errors
///
/// `NotFound` if none is common.
pub fn select_signature(peer_cap: u32, local_cap: u32, prefer_speed: bool) -> Result<u32> {
    let common = peer_cap & local_cap & SIGNATURE_MASK;
    let order = if prefer_speed {
        [SIGN_MD5, SIGN_SHA1]
    } else {
        [SIGN_SHA1, SIGN_MD5]
    };
    order
        .into_iter()
        .find(|&sign| common & sign != 0)
        .ok_or_else(|| {
            CryptoError::NoCommonCapability {
                what: "signature",
                peer_cap,
                local_cap,
            }
            .into()
        })
}

/// GETPUBKEY payload: the local capability word in hex
pub fn generate_getpubkey_message(local_cap: u32) -> String {
    format!("{local_cap:x}")
}

/// Parse a GETPUBKEY payload
///
/// # Errors
///
/// `Malformed` if the text is not a hex number.
pub fn parse_getpubkey_message(text: &str) -> Result<u32> {
    u32::from_str_radix(text.trim(), 16)
        .map_err(|_| IpmsgError::malformed(format!("GETPUBKEY capability {text:?}")))
}

/// Split an ANSPUBKEY payload `<cap>:<e>-<n>` into its parts, hex lower-cased
///
/// # Errors
///
/// `Malformed` if a separator is missing or a field is not hex.
pub fn parse_anspubkey_message(text: &str) -> Result<(u32, String, String)> {
    let malformed = || ProtocolError::Malformed {
        reason: format!("ANSPUBKEY payload {text:?}"),
    };
    let (cap, key) = text.split_once(':').ok_or_else(malformed)?;
    let (e, n) = key.split_once('-').ok_or_else(malformed)?;
    let cap = u32::from_str_radix(cap.trim(), 16).map_err(|_| malformed())?;
    let e = e.trim().to_ascii_lowercase();
    let n = n.trim_end_matches('\0').trim().to_ascii_lowercase();
    for part in [&e, &n] {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed().into());
        }
    }
    Ok((cap, e, n))
}

/// Build a public key from hex exponent and modulus
///
/// # Errors
///
/// `InvalidArgument` if the numbers do not form a usable RSA key.
pub fn public_key_from_hex(e_hex: &str, n_hex: &str) -> Result<RsaPublicKey> {
    let e = BigUint::from_bytes_be(&hex_to_bin(e_hex)?);
    let n = BigUint::from_bytes_be(&hex_to_bin(n_hex)?);
    RsaPublicKey::new(n, e).map_err(|err| {
        CryptoError::InvalidKey {
            reason: err.to_string(),
        }
        .into()
    })
}

/// Encrypt a session key for a peer.
///
/// The asymmetric capability is derived from the peer modulus length and must
/// also appear in `peer_cap`.
///
/// # Errors
///
/// `NotFound` if the modulus size is not one the peer advertises,
/// `InvalidArgument` on a bad key, `CryptoBackendError` if RSA fails.
pub fn wrap_session_key(peer_cap: u32, peer_e: &str, peer_n: &str, session_key: &[u8]) -> Result<(String, u32)> {
    let public_key = public_key_from_hex(peer_e, peer_n)?;
    let size = RsaSize::from_bits(public_key.n().bits())
        .filter(|size| peer_cap & size.capability() != 0)
        .ok_or(CryptoError::NoCommonCapability {
            what: "asymmetric",
            peer_cap,
            local_cap: ASYMMETRIC_MASK,
        })?;
    let wrapped = public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, session_key)
        .map_err(|e| CryptoError::Encryption {
            reason: format!("session key: {e}"),
        })?;
    Ok((bin_to_hex(&wrapped), size.capability()))
}

/// Check a peer signature over `message`.
///
/// Returns `Ok(false)` when the signature does not match.
///
/// # Errors
///
/// `NotFound` if `sign_type` is unknown or absent from `cap`,
/// `InvalidArgument` if the peer key or signature hex is unusable.
pub fn verify(cap: u32, sign_type: u32, message: &[u8], hex_signature: &str, peer_e: &str, peer_n: &str) -> Result<bool> {
    if cap & sign_type == 0 || sign_type & !SIGNATURE_MASK != 0 {
        return Err(CryptoError::UnknownCapability { cap: sign_type }.into());
    }
    let public_key = public_key_from_hex(peer_e, peer_n)?;
    let signature = hex_to_bin(hex_signature)?;
    let outcome = match sign_type {
        SIGN_SHA1 => public_key.verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(message), &signature),
        SIGN_MD5 => public_key.verify(Pkcs1v15Sign::new::<Md5>(), &Md5::digest(message), &signature),
        other => return Err(CryptoError::UnknownCapability { cap: other }.into()),
    };
    Ok(outcome.is_ok())
}

/// Hex exponent and modulus of a public key
pub fn public_key_to_hex(key: &RsaPublicKey) -> (String, String) {
    (bin_to_hex(&key.e().to_bytes_be()), bin_to_hex(&key.n().to_bytes_be()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::protocol::crypto_cap::{AES_256, SYMMETRIC_MASK};
    use crate::utils::ErrorKind;
    use std::sync::{Arc, OnceLock};

    /// Two shared rings with 512 and 1024 bit slots
    pub(crate) fn test_rings() -> (Arc<KeyRing>, Arc<KeyRing>) {
        static RINGS: OnceLock<(Arc<KeyRing>, Arc<KeyRing>)> = OnceLock::new();
        RINGS
            .get_or_init(|| {
                let sizes = [RsaSize::Rsa512, RsaSize::Rsa1024];
                (
                    Arc::new(KeyRing::generate(&sizes).unwrap()),
                    Arc::new(KeyRing::generate(&sizes).unwrap()),
                )
            })
            .clone()
    }

    #[test]
    fn test_size_mapping() {
        for size in RsaSize::BY_STRENGTH {
            assert_eq!(RsaSize::from_capability(size.capability()), Some(size));
            assert_eq!(RsaSize::from_bits(size.bits()), Some(size));
        }
        assert_eq!(RsaSize::from_capability(RSA_512 | RSA_1024), None);
        assert_eq!(RsaSize::from_bits(4096), None);
    }

    #[test]
    fn test_ring_capability() {
        let (ring, _) = test_rings();
        assert_eq!(ring.asymmetric_capability(), RSA_512 | RSA_1024);
        assert_eq!(ring.sizes(), vec![RsaSize::Rsa1024, RsaSize::Rsa512]);
        let cap = ring.local_capability();
        assert_eq!(cap & SYMMETRIC_MASK, SYMMETRIC_MASK);
        assert_ne!(cap & SIGN_SHA1, 0);
        assert_eq!(cap & RSA_2048, 0);
    }

    #[test]
    fn test_select_asymmetric() {
        assert_eq!(
            select_asymmetric_key(ASYMMETRIC_MASK, RSA_512 | RSA_1024).unwrap(),
            RsaSize::Rsa1024
        );
        assert_eq!(select_asymmetric_key(RSA_512, ASYMMETRIC_MASK).unwrap(), RsaSize::Rsa512);
        let err = select_asymmetric_key(RSA_2048, RSA_512).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_select_signature() {
        let both = SIGN_MD5 | SIGN_SHA1;
        assert_eq!(select_signature(both, both, true).unwrap(), SIGN_MD5);
        assert_eq!(select_signature(both, both, false).unwrap(), SIGN_SHA1);
        assert_eq!(select_signature(SIGN_MD5, both, false).unwrap(), SIGN_MD5);
        assert_eq!(select_signature(both, both, false).unwrap(), select_signature(both, both, false).unwrap());
        let err = select_signature(AES_256, both, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_getpubkey_payload() {
        let text = generate_getpubkey_message(0x0030_0003);
        assert_eq!(text, "300003");
        assert_eq!(parse_getpubkey_message(&text).unwrap(), 0x0030_0003);
        assert!(parse_getpubkey_message("xyz").is_err());
    }

    #[test]
    fn test_anspubkey_exchange() {
        let (ring, _) = test_rings();
        let text = ring.generate_anspubkey_message(RSA_512 | RSA_1024 | SIGN_SHA1).unwrap();
        let (cap, e, n) = parse_anspubkey_message(&text).unwrap();
        assert_eq!(cap, ring.local_capability());
        assert_eq!(e, "010001");
        let key = public_key_from_hex(&e, &n).unwrap();
        assert_eq!(key.n().bits(), 1024);

        let text = ring.generate_anspubkey_message(RSA_512).unwrap();
        let (_, e, n) = parse_anspubkey_message(&text).unwrap();
        assert_eq!(public_key_from_hex(&e, &n).unwrap().n().bits(), 512);

        assert!(ring.generate_anspubkey_message(RSA_2048).is_err());
    }

    #[test]
    fn test_parse_anspubkey_rejects_garbage() {
        for bad in ["", "3", "3:010001", "zz:01-02", "3:0x1-ab", "3:-ab"] {
            let err = parse_anspubkey_message(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Malformed, "{bad}");
        }
        let (_, e, n) = parse_anspubkey_message("3:010001-ABCD").unwrap();
        assert_eq!((e.as_str(), n.as_str()), ("010001", "abcd"));
    }

    #[test]
    fn test_session_key_wrap_unwrap() {
        let (alice, bob) = test_rings();
        let bob_key = bob.key(RsaSize::Rsa1024).unwrap().to_public_key();
        let (e, n) = public_key_to_hex(&bob_key);

        let session_key = [7u8; 32];
        let (wrapped, asym) = wrap_session_key(bob.local_capability(), &e, &n, &session_key).unwrap();
        assert_eq!(asym, RSA_1024);
        assert_eq!(wrapped, wrapped.to_lowercase());

        let unwrapped = bob.unwrap_session_key(asym, &wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), &session_key);
        if let Ok(other) = alice.unwrap_session_key(asym, &wrapped) {
            assert_ne!(other.as_slice(), &session_key);
        }
        assert_eq!(
            bob.unwrap_session_key(RSA_2048, &wrapped).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_wrap_requires_advertised_size() {
        let (_, bob) = test_rings();
        let (e, n) = public_key_to_hex(&bob.key(RsaSize::Rsa1024).unwrap().to_public_key());
        let err = wrap_session_key(RSA_512, &e, &n, &[1u8; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_sign_and_verify() {
        let (alice, bob) = test_rings();
        let (e, n) = public_key_to_hex(&alice.key(RsaSize::Rsa512).unwrap().to_public_key());
        let cap = alice.local_capability();

        for sign_type in [SIGN_MD5, SIGN_SHA1] {
            let signature = alice.sign(RSA_512, sign_type, b"payload").unwrap();
            assert!(verify(cap, sign_type, b"payload", &signature, &e, &n).unwrap());
            assert!(!verify(cap, sign_type, b"payloaD", &signature, &e, &n).unwrap());

            let forged = bob.sign(RSA_512, sign_type, b"payload").unwrap();
            assert!(!verify(cap, sign_type, b"payload", &forged, &e, &n).unwrap());
        }

        assert!(verify(SIGN_MD5, SIGN_SHA1, b"x", "00", &e, &n).is_err());
        assert!(alice.sign(RSA_512, AES_256, b"x").is_err());
    }

    #[test]
    fn test_init_keys_generates_then_loads() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = KeyStore::open(temp.path().join("keys")).unwrap();

        let first = KeyRing::init_keys(&store, &[RsaSize::Rsa512], Some("pw")).unwrap();
        assert!(store.private_key_path(512).exists());
        assert!(store.public_key_path(512).exists());

        let second = KeyRing::init_keys(&store, &[RsaSize::Rsa512], Some("pw")).unwrap();
        assert_eq!(
            first.key(RsaSize::Rsa512).unwrap(),
            second.key(RsaSize::Rsa512).unwrap()
        );

        let err = KeyRing::init_keys(&store, &[RsaSize::Rsa512], Some("other")).unwrap_err();
        assert!(err.is_fatal_at_startup());
    }
}
