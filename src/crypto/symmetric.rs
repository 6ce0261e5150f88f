//! Symmetric ciphers for the message body.
//!
//! IPMSG encrypts message bodies in CBC mode with an all-zero IV and PKCS#7
//! padding. Every message carries its own session key.

use crate::transport::protocol::crypto_cap::{
    AES_128, AES_192, AES_256, BLOWFISH_128, BLOWFISH_256, RC2_128, RC2_256, RC2_40,
    SYMMETRIC_MASK,
};
use crate::utils::{CryptoError, IpmsgError, Result};
use cbc::cipher::{
    block_padding::Pkcs7, BlockCipher, BlockDecryptMut, BlockEncryptMut, InnerIvInit, Iv,
    KeyInit,
};

/// Symmetric capabilities from strongest to weakest
pub const SYMMETRIC_PREFERENCE: [u32; 8] = [
    AES_256,
    BLOWFISH_256,
    RC2_256,
    AES_192,
    AES_128,
    BLOWFISH_128,
    RC2_128,
    RC2_40,
];

/// Every symmetric capability this build implements
pub const SUPPORTED_SYMMETRIC: u32 = SYMMETRIC_MASK;

/// Key length in bytes for a symmetric capability
///
/// # Errors
///
/// `NotFound` if `cipher_cap` is not exactly one known symmetric bit.
pub fn key_length_for(cipher_cap: u32) -> Result<usize> {
    match cipher_cap {
        RC2_40 => Ok(5),
        RC2_128 | BLOWFISH_128 | AES_128 => Ok(16),
        AES_192 => Ok(24),
        RC2_256 | BLOWFISH_256 | AES_256 => Ok(32),
        other => Err(CryptoError::UnknownCapability { cap: other }.into()),
    }
}

/// Pick the cipher both sides support.
///
/// Scans [`SYMMETRIC_PREFERENCE`] from the weak end when `prefer_speed`,
/// otherwise from the strong end.
///
/// # Errors
///
/// `NotFound` if the capability sets do not intersect.
pub fn select_symmetric_key(peer_cap: u32, local_cap: u32, prefer_speed: bool) -> Result<u32> {
    let common = peer_cap & local_cap & SYMMETRIC_MASK;
    let found = if prefer_speed {
        SYMMETRIC_PREFERENCE.iter().rev().find(|&&cap| common & cap != 0)
    } else {
        SYMMETRIC_PREFERENCE.iter().find(|&&cap| common & cap != 0)
    };
    found.copied().ok_or_else(|| {
        CryptoError::NoCommonCapability {
            what: "symmetric",
            peer_cap,
            local_cap,
        }
        .into()
    })
}

/// Encrypt `plaintext` in CBC mode with a zero IV
///
/// # Errors
///
/// `NotFound` for an unknown capability, `InvalidArgument` if `key` has the
/// wrong length for it.
pub fn encrypt_cbc(cipher_cap: u32, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    check_key(cipher_cap, key)?;
    match cipher_cap {
        AES_128 => Ok(cbc_encrypt(aes::Aes128::new_from_slice(key).map_err(bad_key)?, plaintext)),
        AES_192 => Ok(cbc_encrypt(aes::Aes192::new_from_slice(key).map_err(bad_key)?, plaintext)),
        AES_256 => Ok(cbc_encrypt(aes::Aes256::new_from_slice(key).map_err(bad_key)?, plaintext)),
        BLOWFISH_128 | BLOWFISH_256 => Ok(cbc_encrypt(
            <blowfish::Blowfish as KeyInit>::new_from_slice(key).map_err(bad_key)?,
            plaintext,
        )),
        _ => Ok(cbc_encrypt(rc2_cipher(key), plaintext)),
    }
}

/// Decrypt `ciphertext` produced by [`encrypt_cbc`].
///
/// The result always ends with a NUL byte; one is appended when the
/// plaintext did not carry its own.
///
/// # Errors
///
/// As [`encrypt_cbc`], plus `CryptoBackendError` when the padding does not
/// check out (wrong key or tampered body).
pub fn decrypt_cbc(cipher_cap: u32, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut plaintext = decrypt_raw(cipher_cap, key, ciphertext)?;
    if plaintext.last() != Some(&0) {
        plaintext.push(0);
    }
    Ok(plaintext)
}

fn decrypt_raw(cipher_cap: u32, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    check_key(cipher_cap, key)?;
    match cipher_cap {
        AES_128 => cbc_decrypt(aes::Aes128::new_from_slice(key).map_err(bad_key)?, ciphertext),
        AES_192 => cbc_decrypt(aes::Aes192::new_from_slice(key).map_err(bad_key)?, ciphertext),
        AES_256 => cbc_decrypt(aes::Aes256::new_from_slice(key).map_err(bad_key)?, ciphertext),
        BLOWFISH_128 | BLOWFISH_256 => cbc_decrypt(
            <blowfish::Blowfish as KeyInit>::new_from_slice(key).map_err(bad_key)?,
            ciphertext,
        ),
        _ => cbc_decrypt(rc2_cipher(key), ciphertext),
    }
}

fn check_key(cipher_cap: u32, key: &[u8]) -> Result<()> {
    let expected = key_length_for(cipher_cap)?;
    if key.len() != expected {
        return Err(IpmsgError::invalid_argument(format!(
            "cipher {cipher_cap:#x} needs a {expected}-byte key, got {}",
            key.len()
        )));
    }
    Ok(())
}

fn bad_key(err: cbc::cipher::InvalidLength) -> IpmsgError {
    CryptoError::InvalidKey {
        reason: err.to_string(),
    }
    .into()
}

// Effective key bits follow the key length, as the 40-bit variant requires.
fn rc2_cipher(key: &[u8]) -> rc2::Rc2 {
    rc2::Rc2::new_with_eff_key_len(key, key.len() * 8)
}

fn cbc_encrypt<C>(cipher: C, plaintext: &[u8]) -> Vec<u8>
where
    C: BlockCipher + BlockEncryptMut,
{
    let iv = Iv::<cbc::Encryptor<C>>::default();
    cbc::Encryptor::<C>::inner_iv_init(cipher, &iv).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn cbc_decrypt<C>(cipher: C, ciphertext: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockDecryptMut,
{
    let iv = Iv::<cbc::Decryptor<C>>::default();
    cbc::Decryptor::<C>::inner_iv_init(cipher, &iv)
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| {
            CryptoError::Decryption {
                reason: "bad padding".to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_key(cap: u32) -> Vec<u8> {
        let mut key = vec![0u8; key_length_for(cap).unwrap()];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_key_lengths() {
        assert_eq!(key_length_for(RC2_40).unwrap(), 5);
        assert_eq!(key_length_for(BLOWFISH_128).unwrap(), 16);
        assert_eq!(key_length_for(AES_192).unwrap(), 24);
        assert_eq!(key_length_for(RC2_256).unwrap(), 32);
        assert!(key_length_for(0).is_err());
        assert!(key_length_for(AES_128 | AES_256).is_err());
    }

    #[test]
    fn test_roundtrip_all_ciphers() {
        // Empty, one short of a block, block-aligned and straddling lengths.
        let lengths = [0usize, 1, 7, 8, 15, 16, 17, 33, 1000];
        for cap in SYMMETRIC_PREFERENCE {
            let key = random_key(cap);
            for len in lengths {
                let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let ciphertext = encrypt_cbc(cap, &key, &plaintext).unwrap();
                assert!(ciphertext.len() > plaintext.len(), "cap {cap:#x} len {len}");
                let decrypted = decrypt_cbc(cap, &key, &ciphertext).unwrap();
                let mut expected = plaintext.clone();
                if expected.last() != Some(&0) {
                    expected.push(0);
                }
                assert_eq!(decrypted, expected, "cap {cap:#x} len {len}");
            }
        }
    }

    #[test]
    fn test_decrypt_appends_missing_nul() {
        let key = [7u8; 16];
        let ciphertext = encrypt_cbc(AES_128, &key, b"hello").unwrap();
        assert_eq!(decrypt_cbc(AES_128, &key, &ciphertext).unwrap(), b"hello\0");

        let ciphertext = encrypt_cbc(AES_128, &key, b"hello\0").unwrap();
        assert_eq!(decrypt_cbc(AES_128, &key, &ciphertext).unwrap(), b"hello\0");

        let ciphertext = encrypt_cbc(AES_128, &key, b"").unwrap();
        assert_eq!(decrypt_cbc(AES_128, &key, &ciphertext).unwrap(), b"\0");
    }

    #[test]
    fn test_zero_iv_is_deterministic() {
        let key = random_key(AES_128);
        let a = encrypt_cbc(AES_128, &key, b"same message").unwrap();
        let b = encrypt_cbc(AES_128, &key, b"same message").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let err = encrypt_cbc(AES_256, &[0u8; 16], b"x").unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = random_key(BLOWFISH_256);
        let ciphertext = encrypt_cbc(BLOWFISH_256, &key, b"hello there").unwrap();
        assert!(decrypt_cbc(BLOWFISH_256, &key, &ciphertext[..ciphertext.len() - 1]).is_err());
    }

    #[test]
    fn test_selection_strong_and_fast() {
        let peer = AES_128 | AES_256 | RC2_40;
        let local = SUPPORTED_SYMMETRIC;
        assert_eq!(select_symmetric_key(peer, local, false).unwrap(), AES_256);
        assert_eq!(select_symmetric_key(peer, local, true).unwrap(), RC2_40);
    }

    #[test]
    fn test_selection_is_member_of_intersection() {
        let local = BLOWFISH_128 | AES_192 | RC2_128;
        for peer in [AES_192, BLOWFISH_128 | RC2_128, SYMMETRIC_MASK] {
            for fast in [false, true] {
                let chosen = select_symmetric_key(peer, local, fast).unwrap();
                assert_ne!(chosen & peer & local, 0);
                assert_eq!(chosen, select_symmetric_key(peer, local, fast).unwrap());
            }
        }
    }

    #[test]
    fn test_selection_empty_intersection() {
        let err = select_symmetric_key(AES_256, RC2_40, false).unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::NotFound);
    }
}
