//! The IPMSG protocol engine.
//!
//! [`ProtocolEngine`] owns handles to every shared table (peer directory,
//! retry ledger, key ring) and ties them to the wire codec. Inbound datagrams
//! go through [`ProtocolEngine::handle_datagram`]; outbound packets are built
//! by the `send_*` constructors. The engine holds no lock while it calls the
//! transport or an observer.

pub mod dispatch;
pub mod events;
pub mod outbound;

#[cfg(test)]
pub(crate) mod testing;

pub use events::*;
pub use outbound::SendOptions;

use crate::crypto::{EnvelopeCipher, KeyRing};
use crate::network::{PeerDirectory, RetryLedger};
use crate::transport::codec::PacketCodec;
use crate::transport::protocol::option;
use crate::transport::udp::PacketSink;
use crate::utils::IpmsgConfig;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Received SENDMSG packets remembered for duplicate suppression
pub const RECENT_PACKET_WINDOW: usize = 128;

/// Answer to GETABSENCEINFO while present
pub const NOT_ABSENT_TEXT: &str = "Not absence mode";

/// Engine settings taken from the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Display name in entry packets
    pub nickname: String,
    /// Group in entry packets
    pub group: String,
    /// Port peers listen on
    pub port: u16,
    /// Broadcast destinations
    pub broadcast_addresses: Vec<IpAddr>,
    /// Advertise and use encryption
    pub crypto_enabled: bool,
    /// Answer host-list requests
    pub hostlist_serve: bool,
    /// Request host lists
    pub hostlist_want: bool,
    /// Entries per host-list page
    pub hostlist_page_size: usize,
    /// GETPUBKEY attempts while waiting for a key
    pub pubkey_wait_retries: u32,
    /// Delay between those attempts
    pub pubkey_wait: Duration,
    /// Pass traffic to the message log
    pub log_messages: bool,
}

impl EngineOptions {
    /// Options from a loaded configuration
    pub fn from_config(config: &IpmsgConfig) -> Self {
        Self {
            nickname: config.identity.nickname.clone(),
            group: config.identity.group.clone(),
            port: config.network.port,
            broadcast_addresses: config.network.broadcast_addresses.clone(),
            crypto_enabled: config.crypto.enabled,
            hostlist_serve: config.hostlist.serve,
            hostlist_want: config.hostlist.want,
            hostlist_page_size: config.hostlist.page_size,
            pubkey_wait_retries: config.crypto.pubkey_wait_retries,
            pubkey_wait: config.crypto.pubkey_wait(),
            log_messages: config.logging.log_messages,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&IpmsgConfig::default())
    }
}

/// The protocol engine
pub struct ProtocolEngine {
    codec: PacketCodec,
    options: EngineOptions,
    peers: Arc<PeerDirectory>,
    ledger: Arc<RetryLedger>,
    envelope: Option<EnvelopeCipher>,
    sink: Arc<dyn PacketSink>,
    observer: Arc<dyn EngineObserver>,
    message_log: Arc<dyn MessageLog>,
    attachments: Arc<dyn AttachmentStore>,
    absence: Mutex<Option<String>>,
    recent: Mutex<VecDeque<(IpAddr, u32)>>,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("codec", &self.codec)
            .field("options", &self.options)
            .field("peers", &self.peers)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    /// Create an engine with fresh tables.
    ///
    /// `keys` is required for encryption; without it the engine neither
    /// advertises nor accepts encrypted messages.
    pub fn new(
        codec: PacketCodec,
        options: EngineOptions,
        keys: Option<Arc<KeyRing>>,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        let peers = Arc::new(PeerDirectory::new());
        let envelope = keys.filter(|_| options.crypto_enabled).map(|keys| {
            EnvelopeCipher::new(keys, peers.clone(), codec.transcoder().clone(), false)
        });
        Self {
            codec,
            options,
            peers,
            ledger: Arc::new(RetryLedger::default()),
            envelope,
            sink,
            observer: Arc::new(NullObserver),
            message_log: Arc::new(LogMessageLog),
            attachments: Arc::new(NoAttachments),
            absence: Mutex::new(None),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_PACKET_WINDOW)),
        }
    }

    /// Build an engine from configuration
    pub fn from_config(
        config: &IpmsgConfig,
        codec: PacketCodec,
        keys: Option<Arc<KeyRing>>,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        let options = EngineOptions::from_config(config);
        let mut engine = Self::new(codec, options, keys, sink).with_ledger(Arc::new(
            RetryLedger::new(config.delivery.retry_count, config.delivery.retry_interval()),
        ));
        engine.set_prefer_speed(config.crypto.prefer_speed);
        engine
    }

    /// Use an existing retry ledger
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<RetryLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Report events to `observer`
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Send message traffic to `message_log`
    #[must_use]
    pub fn with_message_log(mut self, message_log: Arc<dyn MessageLog>) -> Self {
        self.message_log = message_log;
        self
    }

    /// Release attachments through `attachments`
    #[must_use]
    pub fn with_attachments(mut self, attachments: Arc<dyn AttachmentStore>) -> Self {
        self.attachments = attachments;
        self
    }

    fn set_prefer_speed(&mut self, prefer_speed: bool) {
        if let Some(envelope) = self.envelope.take() {
            self.envelope = Some(EnvelopeCipher::new(
                envelope.keys().clone(),
                self.peers.clone(),
                self.codec.transcoder().clone(),
                prefer_speed,
            ));
        }
    }

    /// The shared peer directory
    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    /// The shared retry ledger
    pub fn ledger(&self) -> &Arc<RetryLedger> {
        &self.ledger
    }

    /// The packet codec
    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    /// Current settings
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Whether encrypted messaging is available
    pub fn crypto_enabled(&self) -> bool {
        self.envelope.is_some()
    }

    /// Local crypto capability word, 0 without keys
    pub fn local_crypto_capability(&self) -> u32 {
        self.envelope.as_ref().map_or(0, EnvelopeCipher::local_capability)
    }

    /// Current absence text
    pub fn absence(&self) -> Option<String> {
        self.absence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Enter (`Some`) or leave (`None`) absence mode without announcing it
    pub fn set_absence_text(&self, text: Option<String>) {
        *self.absence.lock().unwrap_or_else(PoisonError::into_inner) = text;
    }

    /// Option bits for our entry packets
    pub fn entry_options(&self) -> u32 {
        let mut opts = 0;
        if self.absence().is_some() {
            opts |= option::ABSENCEOPT;
        }
        if self.crypto_enabled() {
            opts |= option::ENCRYPTOPT;
        }
        opts
    }

    fn emit(&self, event: &EngineEvent) {
        self.observer.on_event(event);
    }

    /// Returns true if `(from, packet_no)` was seen recently, recording it
    /// otherwise
    fn remember_packet(&self, from: IpAddr, packet_no: u32) -> bool {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.contains(&(from, packet_no)) {
            return true;
        }
        if recent.len() == RECENT_PACKET_WINDOW {
            recent.pop_front();
        }
        recent.push_back((from, packet_no));
        false
    }

    fn seen_packet(&self, from: IpAddr, packet_no: u32) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(from, packet_no))
    }

    fn broadcast_targets(&self) -> Vec<SocketAddr> {
        self.options
            .broadcast_addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.options.port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::transport::protocol::{command, crypto_cap, option};

    #[test]
    fn test_br_entry_from_known_encrypting_peer() {
        let (engine, sink, _) = test_engine(true);
        engine.peers().upsert_from_entry(
            bob_addr(),
            crate::network::EntryInfo {
                user: "bob".to_string(),
                host: "h2".to_string(),
                ..Default::default()
            },
            option::FILEATTACHOPT | option::ENCRYPTOPT,
        );

        engine.handle_datagram(
            bob_addr(),
            b"1:100:bob:h2:4194305:Bob\0dev\0",
        );

        let sent = sink.take_packets();
        let commands: Vec<u32> = sent.iter().map(|(_, p)| p.flags.command()).collect();
        assert_eq!(commands, vec![command::ANSENTRY, command::GETPUBKEY]);
        assert!(sent.iter().all(|(dest, _)| *dest == bob_addr()));

        let ans = &sent[0].1;
        assert_eq!(ans.message, "Alice");
        assert!(ans.flags.has(option::ENCRYPTOPT));

        let getpubkey = &sent[1].1;
        let cap = u32::from_str_radix(&getpubkey.message, 16).unwrap();
        assert_eq!(cap, engine.local_crypto_capability());
        assert_ne!(cap & crypto_cap::RSA_1024, 0);

        let peers = engine.peers().list_snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ipaddr, "10.0.0.2");
        assert_eq!(peers[0].nickname, "Bob");
        assert_eq!(peers[0].group, "dev");
    }

    #[test]
    fn test_entry_options_follow_state() {
        let (engine, _, _) = test_engine(true);
        assert_eq!(engine.entry_options(), option::ENCRYPTOPT);
        engine.set_absence_text(Some("lunch".to_string()));
        assert_eq!(engine.entry_options(), option::ENCRYPTOPT | option::ABSENCEOPT);

        let (plain, _, _) = test_engine(false);
        assert_eq!(plain.entry_options(), 0);
        assert_eq!(plain.local_crypto_capability(), 0);
    }

    #[test]
    fn test_recent_window_is_bounded() {
        let (engine, _, _) = test_engine(false);
        let ip = bob_addr().ip();
        assert!(!engine.remember_packet(ip, 1));
        assert!(engine.remember_packet(ip, 1));
        for n in 2..=RECENT_PACKET_WINDOW as u32 + 1 {
            engine.remember_packet(ip, n);
        }
        assert!(!engine.seen_packet(ip, 1));
        assert!(engine.seen_packet(ip, 2));
    }

    #[tokio::test]
    async fn test_two_engines_exchange_encrypted_message() {
        let net = TestNetwork::new();
        net.a.send_br_entry().unwrap();
        net.pump();

        assert!(net.a.peers().get("10.0.0.2").unwrap().public_key.is_some());
        assert!(net.b.peers().get("10.0.0.1").unwrap().public_key.is_some());

        let options = SendOptions {
            encrypt: true,
            ..SendOptions::default()
        };
        let packet_no = net.a.send_send_msg(bob_addr(), "secret hello", options).await.unwrap();
        assert!(net.a.ledger().is_pending(packet_no));
        net.pump();

        assert!(!net.a.ledger().is_pending(packet_no));
        let messages = net.b_events.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "secret hello");
        assert!(messages[0].encrypted);
        assert_eq!(messages[0].packet_no, packet_no);
    }
}
