//! In-memory collaborators for engine tests.

use super::{EngineEvent, EngineObserver, EngineOptions, ProtocolEngine, ReceivedMessage};
use crate::crypto::asymmetric::tests::test_rings;
use crate::crypto::KeyRing;
use crate::transport::codec::{decode_packet, Packet, PacketCodec, Utf8Transcoder};
use crate::transport::udp::PacketSink;
use crate::utils::Result;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn alice_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], 2425))
}

pub(crate) fn bob_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], 2425))
}

/// Keeps every datagram handed to it
#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSink {
    pub(crate) fn take_raw(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub(crate) fn take_packets(&self) -> Vec<(SocketAddr, Packet)> {
        self.take_raw()
            .into_iter()
            .map(|(dest, bytes)| (dest, decode_packet(&bytes, &Utf8Transcoder, None).unwrap()))
            .collect()
    }
}

impl PacketSink for RecordingSink {
    fn send_datagram(&self, dest: SocketAddr, bytes: &[u8]) -> Result<()> {
        self.sent.lock().unwrap().push((dest, bytes.to_vec()));
        Ok(())
    }
}

/// Keeps every event
#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn messages(&self) -> Vec<ReceivedMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::MessageArrived(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl EngineObserver for RecordingObserver {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub(crate) fn options(nickname: &str, crypto: bool) -> EngineOptions {
    EngineOptions {
        nickname: nickname.to_string(),
        group: String::new(),
        port: 2425,
        broadcast_addresses: vec![IpAddr::from([255, 255, 255, 255])],
        crypto_enabled: crypto,
        hostlist_serve: true,
        hostlist_want: false,
        hostlist_page_size: 100,
        pubkey_wait_retries: 3,
        pubkey_wait: Duration::from_millis(10),
        log_messages: true,
    }
}

pub(crate) fn build(
    user: &str,
    host: &str,
    options: EngineOptions,
    keys: Option<Arc<KeyRing>>,
) -> (ProtocolEngine, Arc<RecordingSink>, Arc<RecordingObserver>) {
    let sink = Arc::new(RecordingSink::default());
    let observer = Arc::new(RecordingObserver::default());
    let codec = PacketCodec::new(user, host, Arc::new(Utf8Transcoder)).unwrap();
    let engine = ProtocolEngine::new(codec, options, keys, sink.clone()).with_observer(observer.clone());
    (engine, sink, observer)
}

/// Alice's engine at 10.0.0.1
pub(crate) fn test_engine(crypto: bool) -> (ProtocolEngine, Arc<RecordingSink>, Arc<RecordingObserver>) {
    test_engine_with(options("Alice", crypto))
}

pub(crate) fn test_engine_with(
    options: EngineOptions,
) -> (ProtocolEngine, Arc<RecordingSink>, Arc<RecordingObserver>) {
    let keys = options.crypto_enabled.then(|| test_rings().0);
    build("alice", "h1", options, keys)
}

/// Alice (10.0.0.1) and Bob (10.0.0.2) wired back to back
pub(crate) struct TestNetwork {
    pub(crate) a: ProtocolEngine,
    pub(crate) b: ProtocolEngine,
    pub(crate) a_sink: Arc<RecordingSink>,
    pub(crate) b_sink: Arc<RecordingSink>,
    pub(crate) a_events: Arc<RecordingObserver>,
    pub(crate) b_events: Arc<RecordingObserver>,
}

impl TestNetwork {
    pub(crate) fn new() -> Self {
        let (alice_keys, bob_keys) = test_rings();
        let (a, a_sink, a_events) = build("alice", "h1", options("Alice", true), Some(alice_keys));
        let (b, b_sink, b_events) = build("bob", "h2", options("Bob", true), Some(bob_keys));
        Self {
            a,
            b,
            a_sink,
            b_sink,
            a_events,
            b_events,
        }
    }

    fn reaches(dest: SocketAddr, target: SocketAddr) -> bool {
        dest.ip() == target.ip() || dest.ip() == IpAddr::from([255, 255, 255, 255])
    }

    /// Deliver queued datagrams both ways until the wire is quiet
    pub(crate) fn pump(&self) {
        for _ in 0..64 {
            let from_a = self.a_sink.take_raw();
            let from_b = self.b_sink.take_raw();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (dest, bytes) in from_a {
                if Self::reaches(dest, bob_addr()) {
                    self.b.handle_datagram(alice_addr(), &bytes);
                }
            }
            for (dest, bytes) in from_b {
                if Self::reaches(dest, alice_addr()) {
                    self.a.handle_datagram(bob_addr(), &bytes);
                }
            }
        }
        panic!("datagrams kept flowing");
    }
}
