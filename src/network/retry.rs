//! Outbound messages waiting for a RECVMSG acknowledgement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Resend attempts after the first transmission
pub const DEFAULT_RETRY_COUNT: u32 = crate::defaults::DEFAULT_RETRY_COUNT;

/// Time between attempts
pub const DEFAULT_RETRY_INTERVAL: Duration =
    Duration::from_secs(crate::defaults::DEFAULT_RETRY_INTERVAL_SECS);

/// A message that has been sent but not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Packet number the acknowledgement must carry
    pub packet_no: u32,
    /// Destination
    pub dest: SocketAddr,
    /// Wire bytes, resent verbatim
    pub bytes: Vec<u8>,
    /// Resends left
    pub retries_left: u32,
    /// Still waiting on the original transmission
    pub first_attempt: bool,
    /// When the next resend is due
    pub next_due: Instant,
}

/// What one sweep decided
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Messages to send again now
    pub resend: Vec<PendingMessage>,
    /// Messages that ran out of attempts
    pub expired: Vec<PendingMessage>,
}

impl SweepOutcome {
    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.resend.is_empty() && self.expired.is_empty()
    }
}

/// Pending messages keyed by packet number
#[derive(Debug)]
pub struct RetryLedger {
    pending: Mutex<HashMap<u32, PendingMessage>>,
    retry_count: u32,
    interval: Duration,
}

impl Default for RetryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL)
    }
}

impl RetryLedger {
    /// Create a ledger with the given budget
    pub fn new(retry_count: u32, interval: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            retry_count,
            interval,
        }
    }

    /// Track a message that is about to be transmitted
    pub fn register(&self, dest: SocketAddr, packet_no: u32, bytes: Vec<u8>) {
        self.register_at(dest, packet_no, bytes, Instant::now());
    }

    /// As [`RetryLedger::register`], with an explicit send time
    pub fn register_at(&self, dest: SocketAddr, packet_no: u32, bytes: Vec<u8>, now: Instant) {
        let message = PendingMessage {
            packet_no,
            dest,
            bytes,
            retries_left: self.retry_count,
            first_attempt: true,
            next_due: now + self.interval,
        };
        let replaced = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(packet_no, message)
            .is_some();
        if replaced {
            log::debug!("Packet {packet_no} re-registered");
        }
    }

    /// Drop the entry for `packet_no`; late or duplicate acks are fine
    pub fn acknowledge(&self, packet_no: u32) -> bool {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&packet_no)
            .is_some();
        if removed {
            log::debug!("Packet {packet_no} acknowledged");
        }
        removed
    }

    /// Forget `packet_no` without it having been acknowledged, as when the
    /// first transmission never left
    pub fn withdraw(&self, packet_no: u32) {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&packet_no)
            .is_some();
        if removed {
            log::debug!("Packet {packet_no} withdrawn");
        }
    }

    /// Whether `packet_no` is still waiting
    pub fn is_pending(&self, packet_no: u32) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&packet_no)
    }

    /// Number of waiting messages
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep against the current time
    pub fn sweep_once(&self) -> SweepOutcome {
        self.sweep_at(Instant::now())
    }

    /// Resend what is due and has attempts left; expire what is due and has
    /// none.
    pub fn sweep_at(&self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, message| {
            if message.next_due > now {
                return true;
            }
            if message.retries_left == 0 {
                outcome.expired.push(message.clone());
                return false;
            }
            message.retries_left -= 1;
            message.first_attempt = false;
            message.next_due = now + self.interval;
            outcome.resend.push(message.clone());
            true
        });
        drop(pending);

        for message in &outcome.expired {
            log::warn!("No acknowledgement for packet {} from {}", message.packet_no, message.dest);
        }
        outcome
    }
}
