//! The encrypted message envelope.
//!
//! An encrypted SENDMSG body is `<cap>:<wrapped key>:<body>[:<signature>]`,
//! all lower-case hex. `cap` names the symmetric cipher, the RSA size used to
//! wrap the session key and, when signed, the digest. The signature covers
//! everything before the last colon.

use crate::crypto::asymmetric::{
    select_asymmetric_key, select_signature, verify, wrap_session_key, KeyRing,
};
use crate::crypto::symmetric::{decrypt_cbc, encrypt_cbc, key_length_for, select_symmetric_key};
use crate::network::directory::{Peer, PeerDirectory, PublicKeyMaterial};
use crate::transport::codec::{bin_to_hex, hex_to_bin, Transcoder};
use crate::transport::protocol::crypto_cap::{ASYMMETRIC_MASK, SIGNATURE_MASK, SYMMETRIC_MASK};
use crate::utils::{CryptoError, NetworkError, ProtocolError, Result};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use zeroize::Zeroizing;

/// A parsed envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Combined capability word
    pub capability: u32,
    /// Wrapped session key, hex
    pub wrapped_key: &'a str,
    /// Ciphertext, hex
    pub body: &'a str,
    /// Signature, hex
    pub signature: Option<&'a str>,
    /// Text the signature covers
    pub signed_part: &'a str,
}

impl<'a> Envelope<'a> {
    /// Split envelope text on its first three colons
    ///
    /// # Errors
    ///
    /// `Malformed` if fewer than three fields are present or the capability
    /// is not hex.
    pub fn parse(text: &'a str) -> Result<Self> {
        let text = text.trim_end_matches('\0');
        let malformed = |reason: &str| ProtocolError::MalformedEnvelope {
            reason: reason.to_string(),
        };
        let mut fields = text.splitn(4, ':');
        let (Some(cap), Some(wrapped_key), Some(body)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed("fewer than three fields").into());
        };
        let signature = fields.next();
        let capability =
            u32::from_str_radix(cap, 16).map_err(|_| malformed("capability is not hex"))?;
        if wrapped_key.is_empty() {
            return Err(malformed("empty session key").into());
        }
        let signed_part = match signature {
            Some(sig) => &text[..text.len() - sig.len() - 1],
            None => text,
        };
        Ok(Self {
            capability,
            wrapped_key,
            body,
            signature,
            signed_part,
        })
    }
}

/// Encrypts and decrypts message bodies for known peers
pub struct EnvelopeCipher {
    keys: Arc<KeyRing>,
    peers: Arc<PeerDirectory>,
    transcoder: Arc<dyn Transcoder>,
    prefer_speed: bool,
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("keys", &self.keys)
            .field("prefer_speed", &self.prefer_speed)
            .finish_non_exhaustive()
    }
}

impl EnvelopeCipher {
    /// Create a cipher over the local keys and the shared directory
    pub fn new(
        keys: Arc<KeyRing>,
        peers: Arc<PeerDirectory>,
        transcoder: Arc<dyn Transcoder>,
        prefer_speed: bool,
    ) -> Self {
        Self {
            keys,
            peers,
            transcoder,
            prefer_speed,
        }
    }

    /// Local key slots
    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    /// Crypto capability advertised to peers
    pub fn local_capability(&self) -> u32 {
        self.keys.local_capability()
    }

    fn peer_with_key(&self, ipaddr: &str) -> Result<(Peer, PublicKeyMaterial)> {
        let peer = self.peers.get(ipaddr).ok_or_else(|| NetworkError::PeerNotFound {
            addr: ipaddr.to_string(),
        })?;
        let key = peer
            .public_key
            .clone()
            .ok_or_else(|| NetworkError::PublicKeyUnavailable {
                addr: ipaddr.to_string(),
                attempts: 0,
            })?;
        Ok((peer, key))
    }

    /// Build an envelope for `ipaddr`.
    ///
    /// The plaintext is transcoded for the peer and NUL-terminated before
    /// encryption. The envelope is signed when a signature algorithm is
    /// common.
    ///
    /// # Errors
    ///
    /// `NotFound` when the peer, its public key or a common cipher is
    /// missing; crypto and transcoding failures otherwise.
    pub fn encrypt_message(&self, ipaddr: &str, plaintext: &str) -> Result<String> {
        let (peer, public_key) = self.peer_with_key(ipaddr)?;
        let peer_cap = peer.crypt_capability;
        let local_cap = self.local_capability();

        let symmetric = select_symmetric_key(peer_cap, local_cap, self.prefer_speed)?;
        let mut session_key = Zeroizing::new(vec![0u8; key_length_for(symmetric)?]);
        OsRng.fill_bytes(&mut session_key);

        let mut encoded = Zeroizing::new(self.transcoder.encode(Some(ipaddr), plaintext)?);
        encoded.push(0);
        let body = encrypt_cbc(symmetric, &session_key, &encoded)?;

        let (wrapped, asymmetric) =
            wrap_session_key(peer_cap, &public_key.exponent, &public_key.modulus, &session_key)?;

        let signing = select_signature(peer_cap, local_cap, self.prefer_speed)
            .ok()
            .zip(select_asymmetric_key(peer_cap, self.keys.asymmetric_capability()).ok());
        let capability = symmetric | asymmetric | signing.map_or(0, |(sign, _)| sign);

        let mut envelope = format!("{capability:x}:{wrapped}:{}", bin_to_hex(&body));
        if let Some((sign, own_size)) = signing {
            let signature = self.keys.sign(own_size.capability(), sign, envelope.as_bytes())?;
            envelope.push(':');
            envelope.push_str(&signature);
        }
        Ok(envelope.to_ascii_lowercase())
    }

    /// Open an envelope received from `ipaddr`.
    ///
    /// # Errors
    ///
    /// `SignatureInvalid` when a supported signature does not verify,
    /// `Malformed` for unparseable text, `NotFound` when a needed key is
    /// missing, crypto and transcoding failures otherwise.
    pub fn decrypt_message(&self, ipaddr: &str, text: &str) -> Result<String> {
        let envelope = Envelope::parse(text)?;
        let local_cap = self.local_capability();
        let sign_type = envelope.capability & SIGNATURE_MASK;

        if let Some(signature) = envelope.signature {
            if sign_type != 0 && sign_type & local_cap == sign_type {
                let (_, public_key) = self.peer_with_key(ipaddr)?;
                let valid = verify(
                    local_cap,
                    sign_type,
                    envelope.signed_part.as_bytes(),
                    signature,
                    &public_key.exponent,
                    &public_key.modulus,
                )?;
                if !valid {
                    log::warn!("Envelope from {ipaddr} failed signature check");
                    return Err(CryptoError::SignatureInvalid.into());
                }
            }
        }

        let symmetric = envelope.capability & SYMMETRIC_MASK;
        let asymmetric = envelope.capability & ASYMMETRIC_MASK;
        let session_key = self.keys.unwrap_session_key(asymmetric, envelope.wrapped_key)?;
        if session_key.len() != key_length_for(symmetric)? {
            return Err(CryptoError::Decryption {
                reason: format!("session key has {} bytes", session_key.len()),
            }
            .into());
        }

        let body = hex_to_bin(envelope.body)?;
        let mut plaintext = Zeroizing::new(decrypt_cbc(symmetric, &session_key, &body)?);
        if let Some(end) = plaintext.iter().position(|&b| b == 0) {
            plaintext.truncate(end);
        }
        self.transcoder.decode(Some(ipaddr), &plaintext)
    }
}
