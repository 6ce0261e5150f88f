//! Outbound packet constructors.

use super::{EngineEvent, ProtocolEngine, NOT_ABSENT_TEXT};
use crate::crypto::asymmetric::generate_getpubkey_message;
use crate::network::{Peer, SweepOutcome};
use crate::transport::codec::{Destination, EncodedPacket, AUTO_PACKET_NO};
use crate::transport::protocol::{command, option, CommandFlags};
use crate::utils::{IpmsgError, NetworkError, Result};
use std::net::SocketAddr;
use std::time::Instant;

/// Per-message choices for [`ProtocolEngine::send_send_msg`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Encrypt if the peer supports it
    pub encrypt: bool,
    /// Sealed until opened
    pub secret: bool,
    /// Ask for a read notice (only meaningful with `secret`)
    pub read_check: bool,
    /// Ask the peer not to log the message
    pub no_log: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            encrypt: true,
            secret: false,
            read_check: false,
            no_log: false,
        }
    }
}

impl ProtocolEngine {
    /// Encode one packet and hand it to the transport
    pub(crate) fn send_packet(
        &self,
        dest: Destination,
        packet_no: u32,
        flags: CommandFlags,
        message: Option<&str>,
        extension: Option<&str>,
    ) -> Result<EncodedPacket> {
        let encoded = self
            .codec
            .encode_packet(&dest, packet_no, flags, message, extension)?;
        self.sink.send_datagram(dest.addr(), &encoded.bytes)?;
        log::trace!("Sent {flags} #{} to {}", encoded.packet_no, dest.addr());
        Ok(encoded)
    }

    fn send_to(&self, to: SocketAddr, flags: CommandFlags, message: Option<&str>, extension: Option<&str>) -> Result<u32> {
        self.send_packet(Destination::Peer(to), AUTO_PACKET_NO, flags, message, extension)
            .map(|encoded| encoded.packet_no)
    }

    /// Send a BR_* packet to every broadcast address and to every dial-up
    /// peer. One packet number is shared by all copies.
    ///
    /// # Errors
    ///
    /// Encoding failures, or a transport failure on every target.
    fn broadcast(&self, flags: CommandFlags, message: Option<&str>, extension: Option<&str>) -> Result<u32> {
        let packet_no = self.codec.next_packet_no();
        let targets = self
            .broadcast_targets()
            .into_iter()
            .map(Destination::Broadcast)
            .chain(self.peers.dialup_targets().into_iter().map(Destination::Peer));

        let mut delivered = 0usize;
        let mut last_error = None;
        for dest in targets {
            match self.send_packet(dest, packet_no, flags, message, extension) {
                Ok(_) => delivered += 1,
                Err(e) if e.kind() == crate::utils::ErrorKind::Io => {
                    log::warn!("Broadcast {flags} to {} failed: {e}", dest.addr());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(packet_no),
        }
    }

    /// Announce ourselves
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_br_entry(&self) -> Result<u32> {
        let flags = CommandFlags::new(command::BR_ENTRY, self.entry_options());
        self.broadcast(flags, Some(&self.options.nickname), Some(&self.options.group))
    }

    /// Announce that we are leaving
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_br_exit(&self) -> Result<u32> {
        let flags = CommandFlags::new(command::BR_EXIT, self.entry_options());
        self.broadcast(flags, Some(&self.options.nickname), Some(&self.options.group))
    }

    /// Announce a change of absence state or nickname
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_br_absence(&self) -> Result<u32> {
        let flags = CommandFlags::new(command::BR_ABSENCE, self.entry_options());
        self.broadcast(flags, Some(&self.options.nickname), Some(&self.options.group))
    }

    /// Enter or leave absence mode and tell everyone
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn set_absence(&self, text: Option<String>) -> Result<u32> {
        self.set_absence_text(text);
        self.send_br_absence()
    }

    /// Ask host-list servers to identify themselves
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_br_isgetlist2(&self) -> Result<u32> {
        self.broadcast(CommandFlags::new(command::BR_ISGETLIST2, 0), None, None)
    }

    /// Answer an entry broadcast
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn ans_entry(&self, to: SocketAddr) -> Result<u32> {
        self.gratuitous_ans_entry(to, self.entry_options())
    }

    /// Unsolicited ANSENTRY with caller-chosen options, used to change what a
    /// peer believes about us (for example to withdraw `ENCRYPTOPT` after a
    /// failed decrypt)
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn gratuitous_ans_entry(&self, to: SocketAddr, opts: u32) -> Result<u32> {
        let flags = CommandFlags::new(command::ANSENTRY, opts);
        self.send_to(to, flags, Some(&self.options.nickname), Some(&self.options.group))
    }

    /// Tell a host-list server we want its list
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_ok_get_list(&self, to: SocketAddr) -> Result<u32> {
        self.send_to(to, CommandFlags::new(command::OKGETLIST, 0), None, None)
    }

    /// Request the host-list page starting at `start`
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_get_list(&self, to: SocketAddr, start: usize) -> Result<u32> {
        let start = start.to_string();
        self.send_to(to, CommandFlags::new(command::GETLIST, 0), Some(&start), None)
    }

    /// Serve one host-list page
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_ans_list(&self, to: SocketAddr, start: usize) -> Result<u32> {
        let page = self.peers.hostlist_page(start, self.options.hostlist_page_size);
        log::debug!("Serving {} host list entries from {start} to {to}", page.count);
        self.send_to(to, CommandFlags::new(command::ANSLIST, 0), Some(&page.text), None)
    }

    /// Tell the sender of `packet_no` that we opened it
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_read_msg(&self, to: SocketAddr, packet_no: u32) -> Result<u32> {
        let flags = CommandFlags::new(command::READMSG, option::READCHECKOPT);
        self.send_to(to, flags, Some(&packet_no.to_string()), None)
    }

    /// Let the sender free the attachments of `packet_no`
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_release_files(&self, to: SocketAddr, packet_no: u32) -> Result<u32> {
        let flags = CommandFlags::new(command::RELEASEFILES, 0);
        self.send_to(to, flags, Some(&packet_no.to_string()), None)
    }

    /// Ask for a peer's version string
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_get_info(&self, to: SocketAddr) -> Result<u32> {
        self.send_to(to, CommandFlags::new(command::GETINFO, 0), None, None)
    }

    /// Ask for a peer's absence text
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_get_absence_info(&self, to: SocketAddr) -> Result<u32> {
        self.send_to(to, CommandFlags::new(command::GETABSENCEINFO, 0), None, None)
    }

    pub(crate) fn send_info(&self, to: SocketAddr) -> Result<u32> {
        let version = format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let flags = CommandFlags::new(command::SENDINFO, option::AUTORETOPT);
        self.send_to(to, flags, Some(&version), None)
    }

    pub(crate) fn send_absence_info(&self, to: SocketAddr) -> Result<u32> {
        let text = self.absence().unwrap_or_else(|| NOT_ABSENT_TEXT.to_string());
        let flags = CommandFlags::new(command::SENDABSENCEINFO, option::AUTORETOPT);
        self.send_to(to, flags, Some(&text), None)
    }

    /// Request a peer's public key
    ///
    /// # Errors
    ///
    /// `NotFound` without local keys, encoding or transport failure.
    pub fn send_getpubkey(&self, to: SocketAddr) -> Result<u32> {
        let local_cap = self.local_crypto_capability();
        if local_cap == 0 {
            return Err(NetworkError::PublicKeyUnavailable {
                addr: to.ip().to_string(),
                attempts: 0,
            }
            .into());
        }
        let payload = generate_getpubkey_message(local_cap);
        self.send_to(to, CommandFlags::new(command::GETPUBKEY, 0), Some(&payload), None)
    }

    /// Wait for a peer's public key, re-sending GETPUBKEY between polls.
    ///
    /// # Errors
    ///
    /// `NotFound` if no key arrived within the configured retries.
    pub async fn wait_public_key(&self, to: SocketAddr) -> Result<Peer> {
        let ipaddr = to.ip().to_string();
        let attempts = self.options.pubkey_wait_retries;
        for attempt in 0..=attempts {
            if let Some(peer) = self.peers.get(&ipaddr).filter(|p| p.public_key.is_some()) {
                return Ok(peer);
            }
            if attempt == attempts {
                break;
            }
            self.send_getpubkey(to)?;
            tokio::time::sleep(self.options.pubkey_wait).await;
        }
        Err(NetworkError::PublicKeyUnavailable {
            addr: ipaddr,
            attempts,
        }
        .into())
    }

    /// Send a message, encrypted when requested and the peer is capable.
    ///
    /// The message is registered with the retry ledger until the peer's
    /// RECVMSG arrives. Returns the packet number.
    ///
    /// # Errors
    ///
    /// `NotFound` when encryption is required but no key arrives, crypto,
    /// encoding or transport failure otherwise.
    pub async fn send_send_msg(&self, to: SocketAddr, text: &str, opts: SendOptions) -> Result<u32> {
        let mut options = option::SENDCHECKOPT;
        if opts.secret {
            options |= option::SECRETOPT;
            if opts.read_check {
                options |= option::READCHECKOPT;
            }
        }
        if opts.no_log {
            options |= option::NOLOGOPT;
        }

        let ipaddr = to.ip().to_string();
        let peer_encrypts = self.peers.get(&ipaddr).is_some_and(|p| p.wants_encryption());
        let envelope = match &self.envelope {
            Some(envelope) if opts.encrypt && peer_encrypts => {
                self.wait_public_key(to).await?;
                options |= option::ENCRYPTOPT;
                Some(envelope.encrypt_message(&ipaddr, text)?)
            }
            _ => None,
        };

        let flags = CommandFlags::new(command::SENDMSG, options);
        let body = envelope.as_deref().unwrap_or(text);
        let dest = Destination::Peer(to);
        let encoded = self
            .codec
            .encode_packet(&dest, AUTO_PACKET_NO, flags, Some(body), None)?;
        // The RECVMSG may be dispatched before send_datagram returns.
        self.ledger.register(to, encoded.packet_no, encoded.bytes.clone());
        if let Err(e) = self.sink.send_datagram(to, &encoded.bytes) {
            self.ledger.withdraw(encoded.packet_no);
            return Err(e);
        }
        log::trace!("Sent {flags} #{} to {to}", encoded.packet_no);

        if self.options.log_messages && !opts.no_log {
            self.message_log.send_log(&ipaddr, flags, text);
        }
        Ok(encoded.packet_no)
    }

    /// Send an unacknowledged message to the whole LAN
    ///
    /// # Errors
    ///
    /// Encoding or transport failure.
    pub fn send_broadcast_msg(&self, text: &str) -> Result<u32> {
        let flags = CommandFlags::new(command::SENDMSG, option::BROADCASTOPT);
        let packet_no = self.broadcast(flags, Some(text), None)?;
        if self.options.log_messages {
            self.message_log.send_log("broadcast", flags, text);
        }
        Ok(packet_no)
    }

    pub(crate) fn send_auto_reply(&self, to: SocketAddr, text: &str) -> Result<u32> {
        let flags = CommandFlags::new(command::SENDMSG, option::AUTORETOPT);
        self.send_to(to, flags, Some(text), None)
    }

    /// Run one retry sweep now
    pub fn sweep_retries(&self) -> SweepOutcome {
        self.sweep_retries_at(Instant::now())
    }

    /// Resend due messages and report expired ones
    pub fn sweep_retries_at(&self, now: Instant) -> SweepOutcome {
        let outcome = self.ledger.sweep_at(now);
        for message in &outcome.resend {
            log::debug!("Resending packet {} to {}", message.packet_no, message.dest);
            if let Err(e) = self.sink.send_datagram(message.dest, &message.bytes) {
                log::warn!("Resend of packet {} failed: {e}", message.packet_no);
            }
        }
        for message in &outcome.expired {
            self.emit(&EngineEvent::DeliveryFailed {
                dest: message.dest,
                packet_no: message.packet_no,
            });
        }
        outcome
    }

    /// Report a failure to the UI without interrupting anything
    pub(crate) fn report(&self, from: Option<SocketAddr>, err: &IpmsgError) {
        self.emit(&EngineEvent::Error {
            from,
            message: err.to_string(),
        });
    }
}
