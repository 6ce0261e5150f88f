//! Host-list pages exchanged through GETLIST / ANSLIST.
//!
//! A page is `<next_start>\a<count>\a` followed by `count` seven-field
//! entries `user\ahost\a<ANSLIST>\aipaddr\aport\anickname\agroup\a`. Empty
//! text fields are sent as a single backspace so that no field is ever empty.
//! `next_start` is 0 on the last page.

use crate::network::directory::{AddressFamily, EntryInfo, Peer, PeerChange, PeerDirectory, PRIORITY_DEFAULT};
use crate::transport::protocol::{command, option, MIN_UDP_BUFFER};
use crate::utils::{IpmsgError, Result};
use std::net::{IpAddr, SocketAddr};

/// Field separator inside a page
pub const HOSTLIST_SEPARATOR: char = '\u{7}';

/// Placeholder for an empty text field
pub const HOSTLIST_DUMMY: &str = "\u{8}";

/// Serialized page size limit
pub const HOSTLIST_PAGE_LIMIT: usize = MIN_UDP_BUFFER / 2;

const ENTRY_FIELDS: usize = 7;

/// One host-list page ready for ANSLIST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostListPage {
    /// Full page text, header included
    pub text: String,
    /// Index to request next, 0 when the table is exhausted
    pub next_start: usize,
    /// Entries in this page
    pub count: usize,
}

/// Peers learned from one applied page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedPage {
    /// Start index to request next, 0 when the remote side is done
    pub next_start: usize,
    /// Addresses that were not known before
    pub added: Vec<SocketAddr>,
}

fn field(text: &str) -> &str {
    if text.is_empty() {
        HOSTLIST_DUMMY
    } else {
        text
    }
}

fn unfield(text: &str) -> String {
    if text == HOSTLIST_DUMMY {
        String::new()
    } else {
        text.to_string()
    }
}

fn serialize_entry(peer: &Peer) -> String {
    let sep = HOSTLIST_SEPARATOR;
    format!(
        "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}",
        field(&peer.user),
        field(&peer.host),
        command::ANSLIST,
        peer.ipaddr,
        peer.port,
        field(&peer.nickname),
        field(&peer.group),
    )
}

impl PeerDirectory {
    /// Serialize up to `max_entries` peers starting at index `start`.
    ///
    /// The page stops early once it would grow past [`HOSTLIST_PAGE_LIMIT`],
    /// but always carries at least one entry when any remain.
    pub fn hostlist_page(&self, start: usize, max_entries: usize) -> HostListPage {
        let (body, count, total) = self.with_peers(|peers| {
            let mut body = String::new();
            let mut count = 0;
            for peer in peers.iter().skip(start).take(max_entries.max(1)) {
                let entry = serialize_entry(peer);
                if count > 0 && body.len() + entry.len() > HOSTLIST_PAGE_LIMIT {
                    break;
                }
                body.push_str(&entry);
                count += 1;
            }
            (body, count, peers.len())
        });

        let end = start.saturating_add(count);
        let next_start = if end >= total { 0 } else { end };
        let sep = HOSTLIST_SEPARATOR;
        HostListPage {
            text: format!("{next_start:5}{sep}{count:5}{sep}{body}"),
            next_start,
            count,
        }
    }

    /// Merge a received page into the directory.
    ///
    /// Unknown addresses are added as dial-up peers with no capabilities;
    /// known ones are left untouched.
    ///
    /// # Errors
    ///
    /// `Malformed` if the header or an entry cannot be parsed.
    pub fn apply_hostlist_page(&self, family: AddressFamily, text: &str) -> Result<AppliedPage> {
        let text = text.trim_end_matches('\0');
        let mut fields = text.split(HOSTLIST_SEPARATOR);
        let mut header = || -> Result<usize> {
            fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .ok_or_else(|| IpmsgError::malformed("host list header"))
        };
        let next_start = header()?;
        let count = header()?;

        let mut parsed = Vec::new();
        for index in 0..count {
            let entry: Vec<&str> = fields.by_ref().take(ENTRY_FIELDS).collect();
            let [user, host, _command, ip, port, nickname, group] = entry.as_slice() else {
                return Err(IpmsgError::malformed(format!("host list entry {index} truncated")));
            };
            let ip: IpAddr = ip
                .trim()
                .parse()
                .map_err(|_| IpmsgError::malformed(format!("host list address {ip:?}")))?;
            if AddressFamily::from(&ip) != family {
                log::debug!("Skipping host list entry {ip} from another address family");
                continue;
            }
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| IpmsgError::malformed(format!("host list port {port:?}")))?;
            parsed.push((
                SocketAddr::new(ip, port),
                EntryInfo {
                    user: unfield(user),
                    host: unfield(host),
                    nickname: unfield(nickname),
                    group: unfield(group),
                },
            ));
        }

        let added = self.with_peers(|peers| {
            let mut added = Vec::new();
            for (addr, info) in parsed {
                let ipaddr = addr.ip().to_string();
                if peers.iter().any(|p| p.ipaddr == ipaddr) {
                    continue;
                }
                peers.push(Peer {
                    user: info.user,
                    host: info.host,
                    group: info.group,
                    nickname: info.nickname,
                    ipaddr,
                    port: addr.port(),
                    family,
                    capability: option::DIALUPOPT,
                    crypt_capability: 0,
                    public_key: None,
                    priority: PRIORITY_DEFAULT,
                });
                added.push(addr);
            }
            added
        });

        for addr in &added {
            self.notify(&PeerChange::Added(addr.ip().to_string()));
        }
        log::debug!("Host list page added {} peers, next start {next_start}", added.len());
        Ok(AppliedPage { next_start, added })
    }
}
