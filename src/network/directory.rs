//! The shared table of known peers.
//!
//! Peers are keyed by IP address text and kept in insertion order, which is
//! also the order host-list pages are served in. One mutex guards the whole
//! table; observers are called after it has been released.

use crate::transport::protocol::option;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

/// Lowest display priority: hidden from the peer list
pub const PRIORITY_HIDDEN: i8 = -1;
/// Priority given to newly discovered peers
pub const PRIORITY_DEFAULT: i8 = 0;
/// Highest display priority
pub const PRIORITY_MAX: i8 = 4;

/// Address family of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressFamily {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl From<&IpAddr> for AddressFamily {
    fn from(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

/// RSA public key learned through ANSPUBKEY
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicKeyMaterial {
    /// Public exponent, lower-case hex
    pub exponent: String,
    /// Modulus, lower-case hex
    pub modulus: String,
}

/// Identity fields carried by entry packets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryInfo {
    /// Login name
    pub user: String,
    /// Host name
    pub host: String,
    /// Display name
    pub nickname: String,
    /// Group name
    pub group: String,
}

/// A known peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    /// Login name
    pub user: String,
    /// Host name
    pub host: String,
    /// Group name
    pub group: String,
    /// Display name
    pub nickname: String,
    /// IP address text, the directory key
    pub ipaddr: String,
    /// UDP port
    pub port: u16,
    /// Address family
    pub family: AddressFamily,
    /// Option bits from the last entry packet
    pub capability: u32,
    /// Crypto capability word from key exchange
    pub crypt_capability: u32,
    /// Public key, present after a successful exchange
    pub public_key: Option<PublicKeyMaterial>,
    /// Display priority, [`PRIORITY_HIDDEN`] to [`PRIORITY_MAX`]
    pub priority: i8,
}

impl Peer {
    /// Socket address for unicast traffic
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ipaddr.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }

    /// Reachable only by unicast
    pub fn is_dialup(&self) -> bool {
        self.capability & option::DIALUPOPT != 0
    }

    /// Advertised encryption support in its entry packet
    pub fn wants_encryption(&self) -> bool {
        self.capability & option::ENCRYPTOPT != 0
    }

    /// Currently in absence mode
    pub fn is_absent(&self) -> bool {
        self.capability & option::ABSENCEOPT != 0
    }

    /// Nickname if set, user otherwise
    pub fn display_name(&self) -> &str {
        if self.nickname.is_empty() {
            &self.user
        } else {
            &self.nickname
        }
    }
}

/// What changed in the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    /// A peer was added
    Added(String),
    /// A peer's fields were replaced
    Updated(String),
    /// A peer was removed
    Removed(String),
    /// Non-dial-up peers were dropped
    Invalidated,
}

/// Registered by the UI to hear about directory changes
pub trait PeerListObserver: Send + Sync {
    /// Called after every mutation, outside the directory lock
    fn peer_list_changed(&self, change: &PeerChange);
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The address was not known before
    Added,
    /// An existing entry was updated in place
    Updated,
}

/// The peer table
#[derive(Default)]
pub struct PeerDirectory {
    peers: Mutex<Vec<Peer>>,
    observers: Mutex<Vec<Arc<dyn PeerListObserver>>>,
}

impl std::fmt::Debug for PeerDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDirectory")
            .field("peers", &self.len())
            .finish_non_exhaustive()
    }
}

impl PeerDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer
    pub fn add_observer(&self, observer: Arc<dyn PeerListObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn with_peers<R>(&self, f: impl FnOnce(&mut Vec<Peer>) -> R) -> R {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut peers)
    }

    pub(crate) fn notify(&self, change: &PeerChange) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.peer_list_changed(change);
        }
    }

    /// Add a peer or update it in place from an entry packet.
    ///
    /// Every field except the display priority is replaced. Crypto state is
    /// kept as well, since entry packets do not carry it.
    pub fn upsert_from_entry(&self, addr: SocketAddr, info: EntryInfo, command_opts: u32) -> Upsert {
        let ipaddr = addr.ip().to_string();
        let outcome = self.with_peers(|peers| {
            if let Some(peer) = peers.iter_mut().find(|p| p.ipaddr == ipaddr) {
                peer.user = info.user;
                peer.host = info.host;
                peer.nickname = info.nickname;
                peer.group = info.group;
                peer.port = addr.port();
                peer.family = AddressFamily::from(&addr.ip());
                peer.capability = command_opts;
                Upsert::Updated
            } else {
                peers.push(Peer {
                    user: info.user,
                    host: info.host,
                    group: info.group,
                    nickname: info.nickname,
                    ipaddr: ipaddr.clone(),
                    port: addr.port(),
                    family: AddressFamily::from(&addr.ip()),
                    capability: command_opts,
                    crypt_capability: 0,
                    public_key: None,
                    priority: PRIORITY_DEFAULT,
                });
                Upsert::Added
            }
        });
        log::debug!("Peer {ipaddr} {outcome:?}");
        self.notify(&match outcome {
            Upsert::Added => PeerChange::Added(ipaddr),
            Upsert::Updated => PeerChange::Updated(ipaddr),
        });
        outcome
    }

    /// Remove a peer; returns whether it was present
    pub fn remove(&self, ipaddr: &str) -> bool {
        let removed = self.with_peers(|peers| {
            let before = peers.len();
            peers.retain(|p| p.ipaddr != ipaddr);
            peers.len() != before
        });
        if removed {
            log::debug!("Peer {ipaddr} removed");
            self.notify(&PeerChange::Removed(ipaddr.to_string()));
        }
        removed
    }

    /// Drop every peer except dial-up ones, which broadcast probing cannot
    /// rediscover
    pub fn invalidate_all(&self) {
        let dropped = self.with_peers(|peers| {
            let before = peers.len();
            peers.retain(Peer::is_dialup);
            before - peers.len()
        });
        log::debug!("Invalidated {dropped} peers");
        self.notify(&PeerChange::Invalidated);
    }

    /// Set the display priority, clamped to the valid range; returns whether
    /// the peer exists
    pub fn set_priority(&self, ipaddr: &str, priority: i8) -> bool {
        let priority = priority.clamp(PRIORITY_HIDDEN, PRIORITY_MAX);
        let found = self.with_peers(|peers| {
            peers
                .iter_mut()
                .find(|p| p.ipaddr == ipaddr)
                .map(|peer| peer.priority = priority)
                .is_some()
        });
        if found {
            self.notify(&PeerChange::Updated(ipaddr.to_string()));
        }
        found
    }

    /// Copy of one peer
    pub fn get(&self, ipaddr: &str) -> Option<Peer> {
        self.with_peers(|peers| peers.iter().find(|p| p.ipaddr == ipaddr).cloned())
    }

    /// Whether the address is known
    pub fn contains(&self, ipaddr: &str) -> bool {
        self.with_peers(|peers| peers.iter().any(|p| p.ipaddr == ipaddr))
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.with_peers(|peers| peers.len())
    }

    /// True when no peer is known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable copy of the table in insertion order
    pub fn list_snapshot(&self) -> Vec<Peer> {
        self.with_peers(|peers| peers.clone())
    }

    /// Visible peers, highest priority first, then by display name
    pub fn sorted_snapshot(&self) -> Vec<Peer> {
        let mut peers = self.list_snapshot();
        peers.retain(|p| p.priority > PRIORITY_HIDDEN);
        peers.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.display_name().cmp(b.display_name()))
                .then_with(|| a.ipaddr.cmp(&b.ipaddr))
        });
        peers
    }

    /// Store a peer's public key and crypto capability; returns whether the
    /// peer exists
    pub fn replace_public_key(&self, ipaddr: &str, crypt_cap: u32, exponent: &str, modulus: &str) -> bool {
        let found = self.with_peers(|peers| {
            peers
                .iter_mut()
                .find(|p| p.ipaddr == ipaddr)
                .map(|peer| {
                    peer.crypt_capability = crypt_cap;
                    peer.public_key = Some(PublicKeyMaterial {
                        exponent: exponent.to_ascii_lowercase(),
                        modulus: modulus.to_ascii_lowercase(),
                    });
                })
                .is_some()
        });
        if found {
            log::debug!("Stored public key for {ipaddr} (cap {crypt_cap:#x})");
            self.notify(&PeerChange::Updated(ipaddr.to_string()));
        }
        found
    }

    /// Unicast targets for broadcast packets
    pub fn dialup_targets(&self) -> Vec<SocketAddr> {
        self.with_peers(|peers| {
            peers
                .iter()
                .filter(|p| p.is_dialup())
                .filter_map(Peer::socket_addr)
                .collect()
        })
    }
}
