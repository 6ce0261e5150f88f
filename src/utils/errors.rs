//! Error types and handling for the IPMSG engine.
//!
//! This module provides a unified error type across all components of the
//! messenger. Every variant classifies onto one [`ErrorKind`], which is what
//! the dispatcher and the binary use to decide between dropping a packet,
//! reporting to the user and aborting startup.

use thiserror::Error;

/// Result type alias for the engine library
pub type Result<T> = std::result::Result<T, IpmsgError>;

/// Coarse classification of every error the engine can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad caller input
    InvalidArgument,
    /// No matching capability, key or peer
    NotFound,
    /// Unparseable wire data
    Malformed,
    /// Character transcoding failure
    EncodingError,
    /// Insecure key storage
    PermissionDenied,
    /// Allocation failure
    OutOfMemory,
    /// Signature did not verify; the message is dropped but processing continues
    SignatureInvalid,
    /// Failure reported by the underlying crypto implementation
    CryptoBackendError,
    /// Inbound command byte the engine does not know
    UnknownCommand,
    /// Operating system I/O failure
    Io,
    /// Invalid configuration
    Config,
}

/// Comprehensive error type for all engine operations
#[derive(Error, Debug, Clone)]
pub enum IpmsgError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Peer and transport errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Key storage errors
    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Bad caller input
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Transcoding to or from a peer's character set failed
    #[error("Encoding error: {reason}")]
    Encoding {
        /// What could not be transcoded
        reason: String,
    },

    /// Allocation failure
    #[error("Out of memory")]
    OutOfMemory,

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Base64 decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Capability bit not present in a lookup table
    #[error("Unknown capability: {cap:#x}")]
    UnknownCapability {
        /// The unsupported capability word
        cap: u32,
    },

    /// Local and peer capability sets do not intersect
    #[error("No common {what} capability (peer {peer_cap:#x}, local {local_cap:#x})")]
    NoCommonCapability {
        /// Which family was being selected
        what: &'static str,
        /// Peer capability word
        peer_cap: u32,
        /// Local capability word
        local_cap: u32,
    },

    /// No local RSA key for the requested capability
    #[error("No local key for capability {cap:#x}")]
    MissingLocalKey {
        /// Requested asymmetric capability
        cap: u32,
    },

    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected
        reason: String,
    },

    /// Key generation failure
    #[error("Key generation failed: {reason}")]
    KeyGeneration {
        /// Backend message
        reason: String,
    },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureInvalid,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption {
        /// Backend message
        reason: String,
    },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption {
        /// Backend message
        reason: String,
    },

    /// Signing failure
    #[error("Signing failed: {reason}")]
    Signing {
        /// Backend message
        reason: String,
    },
}

/// Peer and transport errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Peer not present in the directory
    #[error("Peer not found: {addr}")]
    PeerNotFound {
        /// Peer IP address
        addr: String,
    },

    /// Peer never answered GETPUBKEY within the retry budget
    #[error("No public key from {addr} after {attempts} attempts")]
    PublicKeyUnavailable {
        /// Peer IP address
        addr: String,
        /// Number of GETPUBKEY requests issued
        attempts: u32,
    },

    /// Invalid network address
    #[error("Invalid address: {address}")]
    InvalidAddress {
        /// Offending address text
        address: String,
    },

    /// Datagram could not be handed to the socket
    #[error("Transport error: {reason}")]
    Transport {
        /// Socket error
        reason: String,
    },
}

/// Wire protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Mandatory fields missing or unparseable
    #[error("Malformed packet: {reason}")]
    Malformed {
        /// What was wrong
        reason: String,
    },

    /// Command not handled by the dispatcher
    #[error("Unknown command: {command:#x}")]
    UnknownCommand {
        /// Command byte
        command: u32,
    },

    /// Encrypted envelope text could not be split
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope {
        /// What was wrong
        reason: String,
    },

    /// Packet larger than the configured datagram limit
    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge {
        /// Encoded size
        size: usize,
        /// Configured limit
        max: usize,
    },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue {
        /// Dotted field path
        field: String,
        /// Offending value
        value: String,
    },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path that was tried
        path: String,
    },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError {
        /// Serializer message
        reason: String,
    },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        /// Directory path
        path: String,
    },

    /// Another instance holds the lock file
    #[error("Another instance is running (lock file {path})")]
    AlreadyRunning {
        /// Lock file path
        path: String,
    },
}

/// Key storage errors
#[derive(Error, Debug, Clone)]
pub enum KeyStoreError {
    /// Ownership, mode or symlink check failed
    #[error("Insecure key storage at {path}: {reason}")]
    PermissionDenied {
        /// Path that failed the check
        path: String,
        /// Which check failed
        reason: String,
    },

    /// Key file does not exist
    #[error("Key file not found: {path}")]
    NotFound {
        /// Missing file
        path: String,
    },

    /// Key file exists but cannot be decoded
    #[error("Corrupt key file {path}: {reason}")]
    Corrupt {
        /// Key file
        path: String,
        /// Decoder message
        reason: String,
    },

    /// The configured passphrase does not unlock the stored private key
    #[error("Passphrase does not decrypt {path}")]
    WrongPassphrase {
        /// Key file
        path: String,
    },
}

impl IpmsgError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Creates an invalid-argument error
    pub fn invalid_argument<S: Into<String>>(reason: S) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates a malformed-packet error
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        ProtocolError::Malformed {
            reason: reason.into(),
        }
        .into()
    }

    /// Classifies this error onto the engine-wide kinds
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Crypto(e) => match e {
                CryptoError::UnknownCapability { .. }
                | CryptoError::NoCommonCapability { .. }
                | CryptoError::MissingLocalKey { .. } => ErrorKind::NotFound,
                CryptoError::InvalidKey { .. } => ErrorKind::InvalidArgument,
                CryptoError::SignatureInvalid => ErrorKind::SignatureInvalid,
                CryptoError::KeyGeneration { .. }
                | CryptoError::Encryption { .. }
                | CryptoError::Decryption { .. }
                | CryptoError::Signing { .. } => ErrorKind::CryptoBackendError,
            },
            Self::Network(e) => match e {
                NetworkError::PeerNotFound { .. } | NetworkError::PublicKeyUnavailable { .. } => {
                    ErrorKind::NotFound
                }
                NetworkError::InvalidAddress { .. } => ErrorKind::InvalidArgument,
                NetworkError::Transport { .. } => ErrorKind::Io,
            },
            Self::Protocol(e) => match e {
                ProtocolError::UnknownCommand { .. } => ErrorKind::UnknownCommand,
                ProtocolError::PacketTooLarge { .. } => ErrorKind::InvalidArgument,
                ProtocolError::Malformed { .. } | ProtocolError::MalformedEnvelope { .. } => {
                    ErrorKind::Malformed
                }
            },
            Self::Config(_) => ErrorKind::Config,
            Self::KeyStore(e) => match e {
                KeyStoreError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
                KeyStoreError::NotFound { .. } => ErrorKind::NotFound,
                KeyStoreError::Corrupt { .. } | KeyStoreError::WrongPassphrase { .. } => {
                    ErrorKind::CryptoBackendError
                }
            },
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Encoding { .. } => ErrorKind::EncodingError,
            Self::OutOfMemory => ErrorKind::OutOfMemory,
            Self::Io(_) => ErrorKind::Io,
            Self::Base64(_) => ErrorKind::Malformed,
            Self::Unexpected(_) => ErrorKind::CryptoBackendError,
        }
    }

    /// Returns true if the receive loop should drop the packet and carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Malformed
                | ErrorKind::UnknownCommand
                | ErrorKind::SignatureInvalid
                | ErrorKind::NotFound
                | ErrorKind::EncodingError
        )
    }

    /// Returns true if this error leaves the process without a usable identity
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::KeyStore(
                KeyStoreError::Corrupt { .. }
                    | KeyStoreError::WrongPassphrase { .. }
                    | KeyStoreError::PermissionDenied { .. }
            )
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureInvalid)
                | Self::KeyStore(KeyStoreError::PermissionDenied { .. })
        )
    }
}

impl From<std::io::Error> for IpmsgError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::OutOfMemory {
            return Self::OutOfMemory;
        }
        Self::Io(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for IpmsgError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}
