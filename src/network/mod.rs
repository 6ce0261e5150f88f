//! Peer bookkeeping.
//!
//! This module provides the shared peer directory, host-list pagination and
//! the retry ledger for messages awaiting acknowledgement.

pub mod directory;
pub mod hostlist;
pub mod retry;

pub use directory::*;
pub use hostlist::{AppliedPage, HostListPage};
pub use retry::{PendingMessage, RetryLedger, SweepOutcome};
