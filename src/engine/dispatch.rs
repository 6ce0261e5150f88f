//! Inbound packet dispatch.

use super::{EngineEvent, ProtocolEngine, ReceivedMessage};
use crate::crypto::asymmetric::{parse_anspubkey_message, parse_getpubkey_message};
use crate::network::{AddressFamily, EntryInfo};
use crate::transport::codec::{decode_packet, Destination, Packet, AUTO_PACKET_NO};
use crate::transport::protocol::{command, option, Command, CommandFlags};
use crate::utils::{CryptoError, ErrorKind, IpmsgError, ProtocolError, Result};
use std::net::SocketAddr;

impl ProtocolEngine {
    /// Decode and act on one datagram. Failures are logged and reported,
    /// never propagated: a bad packet must not stop the receive loop.
    pub fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) {
        let ipaddr = from.ip().to_string();
        let result = decode_packet(bytes, self.codec.transcoder().as_ref(), Some(&ipaddr))
            .and_then(|packet| self.dispatch(from, &packet));
        if let Err(e) = result {
            match e.kind() {
                ErrorKind::UnknownCommand => log::debug!("Ignoring packet from {from}: {e}"),
                _ => log::warn!("Dropped packet from {from}: {e}"),
            }
        }
    }

    /// Act on a decoded packet
    ///
    /// # Errors
    ///
    /// `UnknownCommand` for commands the engine does not handle, `Malformed`
    /// for bad payloads, crypto errors for messages that failed to decrypt.
    pub fn dispatch(&self, from: SocketAddr, packet: &Packet) -> Result<()> {
        log::trace!("Received {} #{} from {from}", packet.flags, packet.packet_no);
        match packet.flags.kind() {
            Command::BrEntry => {
                self.ans_entry(from)?;
                self.on_entry(from, packet)
            }
            Command::AnsEntry | Command::BrAbsence => self.on_entry(from, packet),
            Command::BrExit => {
                self.peers.remove(&from.ip().to_string());
                Ok(())
            }
            Command::BrIsGetList | Command::BrIsGetList2 => {
                if self.options.hostlist_serve {
                    self.send_ok_get_list(from)?;
                }
                Ok(())
            }
            Command::OkGetList => {
                if self.options.hostlist_want {
                    self.send_get_list(from, 0)?;
                }
                Ok(())
            }
            Command::GetList => {
                if self.options.hostlist_serve {
                    let start = packet.message.trim().parse().unwrap_or(0);
                    self.send_ans_list(from, start)?;
                }
                Ok(())
            }
            Command::AnsList => self.on_ans_list(from, packet),
            Command::SendMsg => self.on_send_msg(from, packet),
            Command::RecvMsg => {
                let packet_no = parse_packet_no(&packet.message)?;
                self.ledger.acknowledge(packet_no);
                Ok(())
            }
            Command::ReadMsg => self.on_read_msg(from, packet),
            Command::AnsReadMsg | Command::DelMsg | Command::NoOperation => Ok(()),
            Command::GetInfo => self.send_info(from).map(|_| ()),
            Command::GetAbsenceInfo => self.send_absence_info(from).map(|_| ()),
            Command::SendInfo | Command::SendAbsenceInfo => {
                self.emit(&EngineEvent::InfoReceived {
                    from,
                    absence: packet.flags.command() == command::SENDABSENCEINFO,
                    text: packet.message.clone(),
                });
                Ok(())
            }
            Command::ReleaseFiles => {
                let packet_no = parse_packet_no(&packet.message)?;
                if !self.attachments.release(&from.ip().to_string(), packet_no) {
                    log::debug!("Nothing held for packet {packet_no} from {from}");
                }
                Ok(())
            }
            Command::GetPubKey => self.on_get_pub_key(from, packet),
            Command::AnsPubKey => self.on_ans_pub_key(from, packet),
            Command::Unknown(code) => Err(ProtocolError::UnknownCommand { command: code }.into()),
        }
    }

    fn on_entry(&self, from: SocketAddr, packet: &Packet) -> Result<()> {
        let info = EntryInfo {
            user: packet.user.clone(),
            host: packet.host.clone(),
            nickname: packet.message.clone(),
            group: packet.extension.clone(),
        };
        self.peers.upsert_from_entry(from, info, packet.flags.options());

        let needs_key = self.crypto_enabled()
            && packet.flags.has(option::ENCRYPTOPT)
            && self
                .peers
                .get(&from.ip().to_string())
                .is_some_and(|peer| peer.public_key.is_none());
        if needs_key {
            self.send_getpubkey(from)?;
        }
        Ok(())
    }

    fn on_ans_list(&self, from: SocketAddr, packet: &Packet) -> Result<()> {
        let applied = self
            .peers
            .apply_hostlist_page(AddressFamily::from(&from.ip()), &packet.message)?;
        log::debug!("Host list from {from} added {} peers", applied.added.len());
        if self.crypto_enabled() {
            for addr in &applied.added {
                self.send_getpubkey(*addr)?;
            }
        }
        if applied.next_start != 0 {
            self.send_get_list(from, applied.next_start)?;
        }
        Ok(())
    }

    fn on_send_msg(&self, from: SocketAddr, packet: &Packet) -> Result<()> {
        let flags = packet.flags;
        let ipaddr = from.ip().to_string();

        if !flags.has(option::NOADDLISTOPT) && !self.peers.contains(&ipaddr) {
            let info = EntryInfo {
                user: packet.user.clone(),
                host: packet.host.clone(),
                ..EntryInfo::default()
            };
            self.peers.upsert_from_entry(from, info, 0);
        }

        if self.seen_packet(from.ip(), packet.packet_no) {
            log::debug!("Duplicate packet {} from {from}", packet.packet_no);
            self.acknowledge_message(from, packet)?;
            return Ok(());
        }

        let encrypted = flags.has(option::ENCRYPTOPT);
        let text = if encrypted {
            match self.open_envelope(&ipaddr, &packet.message) {
                Ok(text) => text,
                Err(e) => {
                    self.report(Some(from), &e);
                    if e.kind() != ErrorKind::SignatureInvalid {
                        let opts = self.entry_options() & !option::ENCRYPTOPT;
                        self.gratuitous_ans_entry(from, opts)?;
                    }
                    return Err(e);
                }
            }
        } else {
            packet.message.clone()
        };

        self.remember_packet(from.ip(), packet.packet_no);
        if self.options.log_messages && !flags.has(option::NOLOGOPT) {
            self.message_log.recv_log(&ipaddr, flags, &text);
        }
        self.acknowledge_message(from, packet)?;

        if let Some(absence) = self.absence() {
            if !flags.has(option::NO_REPLY_OPTS) {
                self.send_auto_reply(from, &absence)?;
            }
        }

        self.emit(&EngineEvent::MessageArrived(ReceivedMessage {
            from,
            user: packet.user.clone(),
            host: packet.host.clone(),
            packet_no: packet.packet_no,
            text,
            flags,
            encrypted,
            received_at: chrono::Utc::now(),
        }));
        Ok(())
    }

    fn open_envelope(&self, ipaddr: &str, text: &str) -> Result<String> {
        let envelope = self.envelope.as_ref().ok_or(CryptoError::MissingLocalKey { cap: 0 })?;
        envelope.decrypt_message(ipaddr, text)
    }

    /// RECVMSG for a SENDMSG that asked for one
    fn acknowledge_message(&self, from: SocketAddr, packet: &Packet) -> Result<()> {
        let flags = packet.flags;
        if flags.has(option::SENDCHECKOPT) && !flags.has(option::NO_REPLY_OPTS) {
            let ack = CommandFlags::new(command::RECVMSG, 0);
            let packet_no = packet.packet_no.to_string();
            self.send_packet(Destination::Peer(from), AUTO_PACKET_NO, ack, Some(&packet_no), None)?;
        }
        Ok(())
    }

    fn on_read_msg(&self, from: SocketAddr, packet: &Packet) -> Result<()> {
        let packet_no = parse_packet_no(&packet.message)?;
        self.emit(&EngineEvent::ReadNotified {
            from,
            packet_no,
            at: chrono::Utc::now(),
        });
        if packet.flags.has(option::READCHECKOPT) {
            let flags = CommandFlags::new(command::ANSREADMSG, 0);
            let packet_no = packet.packet_no.to_string();
            self.send_packet(Destination::Peer(from), AUTO_PACKET_NO, flags, Some(&packet_no), None)?;
        }
        Ok(())
    }

    fn on_get_pub_key(&self, from: SocketAddr, packet: &Packet) -> Result<()> {
        let Some(envelope) = &self.envelope else {
            log::debug!("GETPUBKEY from {from} ignored, encryption is off");
            return Ok(());
        };
        let peer_cap = parse_getpubkey_message(&packet.message)?;
        let answer = envelope.keys().generate_anspubkey_message(peer_cap)?;
        let flags = CommandFlags::new(command::ANSPUBKEY, 0);
        self.send_packet(Destination::Peer(from), AUTO_PACKET_NO, flags, Some(&answer), None)?;
        Ok(())
    }

    fn on_ans_pub_key(&self, from: SocketAddr, packet: &Packet) -> Result<()> {
        let (cap, exponent, modulus) = parse_anspubkey_message(&packet.message)?;
        if !self.peers.replace_public_key(&from.ip().to_string(), cap, &exponent, &modulus) {
            log::debug!("Public key from unknown peer {from} dropped");
        }
        Ok(())
    }
}

fn parse_packet_no(text: &str) -> Result<u32> {
    text.trim()
        .parse()
        .map_err(|_| IpmsgError::malformed(format!("packet number {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{EngineEvent, EngineOptions, NOT_ABSENT_TEXT};
    use super::*;
    use crate::engine::SendOptions;
    use crate::network::PRIORITY_HIDDEN;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn datagram(packet_no: u32, command: u32, opts: u32, message: &str) -> Vec<u8> {
        format!("1:{packet_no}:bob:h2:{}:{message}\0\0", command | opts).into_bytes()
    }

    #[test]
    fn test_br_exit_removes_peer() {
        let (engine, _, _) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(1, command::ANSENTRY, 0, "Bob"));
        assert!(engine.peers().contains("10.0.0.2"));
        engine.handle_datagram(bob_addr(), &datagram(2, command::BR_EXIT, 0, "Bob"));
        assert!(engine.peers().is_empty());
    }

    #[test]
    fn test_entry_update_keeps_priority() {
        let (engine, _, _) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(1, command::ANSENTRY, 0, "Bob"));
        engine.peers().set_priority("10.0.0.2", PRIORITY_HIDDEN);
        engine.handle_datagram(bob_addr(), &datagram(2, command::BR_ABSENCE, option::ABSENCEOPT, "Bob (away)"));

        let peer = engine.peers().get("10.0.0.2").unwrap();
        assert_eq!(peer.priority, PRIORITY_HIDDEN);
        assert_eq!(peer.nickname, "Bob (away)");
        assert!(peer.is_absent());
    }

    #[test]
    fn test_plain_message_is_acked_and_reported() {
        let (engine, sink, events) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(500, command::SENDMSG, option::SENDCHECKOPT, "hello"));

        let sent = sink.take_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.flags.command(), command::RECVMSG);
        assert_eq!(sent[0].1.message, "500");

        let messages = events.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello");
        assert!(!messages[0].encrypted);
        assert!(engine.peers().contains("10.0.0.2"));
    }

    #[test]
    fn test_duplicate_message_acked_once_reported_once() {
        let (engine, sink, events) = test_engine(false);
        let bytes = datagram(501, command::SENDMSG, option::SENDCHECKOPT, "again");
        engine.handle_datagram(bob_addr(), &bytes);
        engine.handle_datagram(bob_addr(), &bytes);

        let acks = sink.take_packets();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|(_, p)| p.flags.command() == command::RECVMSG));
        assert_eq!(events.messages().len(), 1);
    }

    #[test]
    fn test_broadcast_message_not_acked() {
        let (engine, sink, events) = test_engine(false);
        let opts = option::SENDCHECKOPT | option::BROADCASTOPT;
        engine.handle_datagram(bob_addr(), &datagram(502, command::SENDMSG, opts, "all"));
        assert!(sink.take_packets().is_empty());
        assert!(events.messages()[0].is_broadcast());
    }

    #[test]
    fn test_noaddlist_sender_not_added() {
        let (engine, _, events) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(503, command::SENDMSG, option::NOADDLISTOPT, "hi"));
        assert!(engine.peers().is_empty());
        assert_eq!(events.messages().len(), 1);
    }

    #[test]
    fn test_absent_engine_auto_replies_once() {
        let (engine, sink, _) = test_engine(false);
        engine.set_absence_text(Some("Out until 3".to_string()));
        engine.handle_datagram(bob_addr(), &datagram(504, command::SENDMSG, option::SENDCHECKOPT, "you there?"));

        let sent = sink.take_packets();
        let commands: Vec<u32> = sent.iter().map(|(_, p)| p.flags.command()).collect();
        assert_eq!(commands, vec![command::RECVMSG, command::SENDMSG]);
        assert!(sent[1].1.flags.has(option::AUTORETOPT));
        assert_eq!(sent[1].1.message, "Out until 3");

        engine.handle_datagram(bob_addr(), &datagram(505, command::SENDMSG, option::AUTORETOPT, "I'm away too"));
        assert!(sink.take_packets().is_empty());
    }

    #[test]
    fn test_recvmsg_acknowledges_ledger() {
        let (engine, _, _) = test_engine(false);
        engine.ledger().register(bob_addr(), 77, Vec::new());
        engine.handle_datagram(bob_addr(), &datagram(9, command::RECVMSG, 0, "77"));
        assert!(!engine.ledger().is_pending(77));
    }

    #[test]
    fn test_malformed_recvmsg_is_dropped() {
        let (engine, _, _) = test_engine(false);
        engine.ledger().register(bob_addr(), 77, Vec::new());
        let packet = decode_packet(&datagram(9, command::RECVMSG, 0, "x7"), &crate::transport::Utf8Transcoder, None).unwrap();
        let err = engine.dispatch(bob_addr(), &packet).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(engine.ledger().is_pending(77));
    }

    #[test]
    fn test_read_notice_with_readcheck() {
        let (engine, sink, events) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(600, command::READMSG, option::READCHECKOPT, "42"));

        let sent = sink.take_packets();
        assert_eq!(sent[0].1.flags.command(), command::ANSREADMSG);
        assert_eq!(sent[0].1.message, "600");
        assert!(matches!(
            events.events()[0],
            EngineEvent::ReadNotified { packet_no: 42, .. }
        ));
    }

    #[test]
    fn test_info_requests() {
        let (engine, sink, _) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(1, command::GETINFO, 0, ""));
        engine.handle_datagram(bob_addr(), &datagram(2, command::GETABSENCEINFO, 0, ""));

        let sent = sink.take_packets();
        assert_eq!(sent[0].1.flags.command(), command::SENDINFO);
        assert!(sent[0].1.message.contains(env!("CARGO_PKG_VERSION")));
        assert_eq!(sent[1].1.flags.command(), command::SENDABSENCEINFO);
        assert_eq!(sent[1].1.message, NOT_ABSENT_TEXT);
    }

    #[test]
    fn test_info_answer_reported() {
        let (engine, _, events) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(3, command::SENDABSENCEINFO, 0, "At lunch"));
        assert_eq!(
            events.events(),
            vec![EngineEvent::InfoReceived {
                from: bob_addr(),
                absence: true,
                text: "At lunch".to_string(),
            }]
        );
    }

    #[test]
    fn test_release_files_reaches_store() {
        struct Counting(AtomicU32);
        impl crate::engine::AttachmentStore for Counting {
            fn release(&self, peer: &str, packet_no: u32) -> bool {
                assert_eq!(peer, "10.0.0.2");
                self.0.store(packet_no, Ordering::SeqCst);
                true
            }
        }

        let store = Arc::new(Counting(AtomicU32::new(0)));
        let (engine, _, _) = test_engine(false);
        let engine = engine.with_attachments(store.clone());
        engine.handle_datagram(bob_addr(), &datagram(4, command::RELEASEFILES, 0, "321"));
        assert_eq!(store.0.load(Ordering::SeqCst), 321);
    }

    #[test]
    fn test_unknown_command_is_error() {
        let (engine, sink, _) = test_engine(false);
        let packet = decode_packet(&datagram(5, command::GETFILEDATA, 0, ""), &crate::transport::Utf8Transcoder, None).unwrap();
        let err = engine.dispatch(bob_addr(), &packet).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCommand);
        assert!(sink.take_packets().is_empty());
    }

    #[test]
    fn test_getpubkey_ignored_without_crypto() {
        let (engine, sink, _) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(6, command::GETPUBKEY, 0, "21003"));
        assert!(sink.take_packets().is_empty());
    }

    #[test]
    fn test_getpubkey_answered_with_key() {
        let (engine, sink, _) = test_engine(true);
        engine.handle_datagram(bob_addr(), &datagram(6, command::GETPUBKEY, 0, "21003"));
        let sent = sink.take_packets();
        assert_eq!(sent[0].1.flags.command(), command::ANSPUBKEY);
        let (cap, exponent, _) = parse_anspubkey_message(&sent[0].1.message).unwrap();
        assert_eq!(cap, engine.local_crypto_capability());
        assert_eq!(exponent, "10001");
    }

    #[test]
    fn test_hostlist_handshake() {
        let options = EngineOptions {
            nickname: "Alice".to_string(),
            crypto_enabled: false,
            hostlist_want: true,
            ..EngineOptions::default()
        };
        let (engine, sink, _) = test_engine_with(options);

        engine.handle_datagram(bob_addr(), &datagram(1, command::OKGETLIST, 0, ""));
        let sent = sink.take_packets();
        assert_eq!(sent[0].1.flags.command(), command::GETLIST);
        assert_eq!(sent[0].1.message, "0");

        let page = "    0\u{7}    1\u{7}carol\u{7}h3\u{7}19\u{7}10.0.0.3\u{7}2425\u{7}Carol\u{7}\u{8}\u{7}";
        engine.handle_datagram(bob_addr(), &datagram(2, command::ANSLIST, 0, page));
        let carol = engine.peers().get("10.0.0.3").unwrap();
        assert_eq!(carol.nickname, "Carol");
        assert!(carol.is_dialup());
        assert!(sink.take_packets().is_empty());
    }

    #[test]
    fn test_hostlist_continuation_fetches_keys_and_next_page() {
        let options = EngineOptions {
            nickname: "Alice".to_string(),
            crypto_enabled: true,
            hostlist_want: true,
            ..EngineOptions::default()
        };
        let (engine, sink, _) = test_engine_with(options);

        let page = "    1\u{7}    1\u{7}carol\u{7}h3\u{7}19\u{7}10.0.0.3\u{7}2425\u{7}Carol\u{7}\u{8}\u{7}";
        engine.handle_datagram(bob_addr(), &datagram(2, command::ANSLIST, 0, page));
        assert!(engine.peers().get("10.0.0.3").unwrap().is_dialup());

        let sent = sink.take_packets();
        assert_eq!(sent.len(), 2);
        let carol: SocketAddr = "10.0.0.3:2425".parse().unwrap();
        assert_eq!(sent[0].0, carol);
        assert_eq!(sent[0].1.flags.command(), command::GETPUBKEY);
        assert_eq!(sent[1].0, bob_addr());
        assert_eq!(sent[1].1.flags.command(), command::GETLIST);
        assert_eq!(sent[1].1.message, "1");
    }

    #[test]
    fn test_hostlist_served_on_request() {
        let (engine, sink, _) = test_engine(false);
        engine.handle_datagram(bob_addr(), &datagram(1, command::ANSENTRY, 0, "Bob"));
        engine.handle_datagram(bob_addr(), &datagram(2, command::BR_ISGETLIST2, 0, ""));
        engine.handle_datagram(bob_addr(), &datagram(3, command::GETLIST, 0, "0"));

        let sent = sink.take_packets();
        assert_eq!(sent[0].1.flags.command(), command::OKGETLIST);
        assert_eq!(sent[1].1.flags.command(), command::ANSLIST);
        assert!(sent[1].1.message.contains("10.0.0.2"));
    }

    #[test]
    fn test_encrypted_message_without_keys_withdraws_encryption() {
        let (engine, sink, events) = test_engine(false);
        let opts = option::SENDCHECKOPT | option::ENCRYPTOPT;
        engine.handle_datagram(bob_addr(), &datagram(7, command::SENDMSG, opts, "21003:00:00"));

        let sent = sink.take_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.flags.command(), command::ANSENTRY);
        assert!(!sent[0].1.flags.has(option::ENCRYPTOPT));
        assert!(events.messages().is_empty());
        assert!(matches!(events.events()[0], EngineEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_read_receipt_round_trip() {
        let net = TestNetwork::new();
        net.a.send_br_entry().unwrap();
        net.pump();

        let opts = SendOptions {
            secret: true,
            read_check: true,
            ..SendOptions::default()
        };
        let packet_no = net.a.send_send_msg(bob_addr(), "open me", opts).await.unwrap();
        net.pump();

        let message = net.b_events.messages().remove(0);
        assert!(message.is_sealed());
        net.b.send_read_msg(alice_addr(), message.packet_no).unwrap();
        net.pump();

        assert!(net.a_events.events().iter().any(|event| matches!(
            event,
            EngineEvent::ReadNotified { packet_no: n, .. } if *n == packet_no
        )));
    }
}
