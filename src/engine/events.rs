//! What the engine reports outward, and the collaborators it reports to.

use crate::transport::protocol::CommandFlags;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

/// Log target for message traffic
pub const MESSAGE_LOG_TARGET: &str = "ipmsg::messages";

/// A message handed to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedMessage {
    /// Sender address
    pub from: SocketAddr,
    /// Sender login name
    pub user: String,
    /// Sender host name
    pub host: String,
    /// Sender's packet number
    pub packet_no: u32,
    /// Decoded (and decrypted) text
    pub text: String,
    /// Flags as received
    pub flags: CommandFlags,
    /// Arrived inside an encrypted envelope
    pub encrypted: bool,
    /// When the engine accepted it
    pub received_at: DateTime<Utc>,
}

impl ReceivedMessage {
    /// Sealed until the user opens it
    pub fn is_sealed(&self) -> bool {
        self.flags.has(crate::transport::protocol::option::SECRETOPT)
    }

    /// Should be shown without a popup
    pub fn is_quiet(&self) -> bool {
        self.flags.has(crate::transport::protocol::option::NOPOPUPOPT)
    }

    /// Sent to everyone rather than to us
    pub fn is_broadcast(&self) -> bool {
        self.flags.has(crate::transport::protocol::option::BROADCASTOPT)
    }

    /// An absence auto-reply
    pub fn is_auto_reply(&self) -> bool {
        self.flags.has(crate::transport::protocol::option::AUTORETOPT)
    }
}

/// Notifications for the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EngineEvent {
    /// A message arrived
    MessageArrived(ReceivedMessage),
    /// A SENDINFO or SENDABSENCEINFO answer arrived
    InfoReceived {
        /// Who answered
        from: SocketAddr,
        /// Answer to GETABSENCEINFO rather than GETINFO
        absence: bool,
        /// The text
        text: String,
    },
    /// A peer opened a sealed message
    ReadNotified {
        /// Who read it
        from: SocketAddr,
        /// Our packet number
        packet_no: u32,
        /// When the notice arrived
        at: DateTime<Utc>,
    },
    /// A message ran out of retries
    DeliveryFailed {
        /// Intended recipient
        dest: SocketAddr,
        /// Our packet number
        packet_no: u32,
    },
    /// A non-fatal problem worth showing the user
    Error {
        /// Peer involved, if any
        from: Option<SocketAddr>,
        /// Description
        message: String,
    },
}

/// Receives engine events; called outside every engine lock
pub trait EngineObserver: Send + Sync {
    /// One event
    fn on_event(&self, event: &EngineEvent);
}

/// Observer that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl EngineObserver for NullObserver {
    fn on_event(&self, _event: &EngineEvent) {}
}

/// Sink for the message log
pub trait MessageLog: Send + Sync {
    /// A message we sent
    fn send_log(&self, peer: &str, flags: CommandFlags, text: &str);

    /// A message we received
    fn recv_log(&self, peer: &str, flags: CommandFlags, text: &str);
}

/// Writes message traffic through the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMessageLog;

impl MessageLog for LogMessageLog {
    fn send_log(&self, peer: &str, flags: CommandFlags, text: &str) {
        log::info!(target: MESSAGE_LOG_TARGET, "-> {peer} [{flags}] {text}");
    }

    fn recv_log(&self, peer: &str, flags: CommandFlags, text: &str) {
        log::info!(target: MESSAGE_LOG_TARGET, "<- {peer} [{flags}] {text}");
    }
}

/// Holder of attachment resources offered with sent messages
pub trait AttachmentStore: Send + Sync {
    /// Release everything offered to `peer` under `packet_no`; returns
    /// whether anything was held
    fn release(&self, peer: &str, packet_no: u32) -> bool;
}

/// Used when file transfer is not wired up
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAttachments;

impl AttachmentStore for NoAttachments {
    fn release(&self, _peer: &str, _packet_no: u32) -> bool {
        false
    }
}
