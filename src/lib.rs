//! # IPMSG Engine
//!
//! A protocol engine for IP Messenger (IPMSG), the serverless LAN messenger
//! that announces peers by UDP broadcast and exchanges short messages with
//! optional RSA-wrapped, signed, symmetric encryption.
//!
//! ## Features
//!
//! - **Wire codec**: `version:packetno:user:host:flags:message\0extension\0`
//!   datagrams with the full command and option vocabulary
//! - **Peer directory**: entry, exit and absence tracking with host-list
//!   paging for peers behind routers
//! - **Reliable delivery**: acknowledgement tracking and periodic resend
//! - **Encryption**: RSA 512/1024/2048 key wrapping, RC2/Blowfish/AES-CBC
//!   bodies and MD5/SHA-1 signatures, negotiated per peer
//! - **Key storage**: PEM key files with ownership and permission checks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ipmsg_engine::{App, IpmsgConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IpmsgConfig::default();
//!     let app = App::new(config, None).await?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`]: wire format, packet numbering and the UDP socket
//! - [`network`]: peer directory, host lists and the retry ledger
//! - [`crypto`]: key ring, key storage and message envelopes
//! - [`engine`]: inbound dispatch and outbound packet constructors
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod engine;
pub mod network;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::App;
pub use crypto::{KeyRing, KeyStore, RsaSize};
pub use engine::{EngineEvent, EngineObserver, ProtocolEngine, SendOptions};
pub use network::{Peer, PeerDirectory};
pub use transport::{Command, CommandFlags, Packet, PacketCodec};
pub use utils::{IpmsgConfig, IpmsgError, Result};

/// Default configuration values
pub mod defaults {
    /// Default UDP port shared by every IPMSG client
    pub const DEFAULT_PORT: u16 = crate::transport::protocol::DEFAULT_PORT;

    /// Default number of resends before a message is reported undeliverable
    pub const DEFAULT_RETRY_COUNT: u32 = 5;

    /// Default seconds between resends
    pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;

    /// Default GETPUBKEY attempts while waiting for a peer key
    pub const DEFAULT_PUBKEY_MAX_RETRY: u32 = 10;

    /// Default milliseconds between GETPUBKEY attempts
    pub const DEFAULT_PUBKEY_WAIT_MS: u64 = 500;

    /// Default host-list entries per ANSLIST page
    pub const DEFAULT_HOSTLIST_PAGE_SIZE: usize = 100;
}
