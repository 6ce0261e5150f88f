//! Transport layer for IPMSG.
//!
//! This module provides the wire protocol constants, the packet codec and
//! the UDP datagram sink.

pub mod codec;
pub mod protocol;
pub mod udp;

pub use codec::*;
pub use protocol::{Command, CommandFlags};
pub use udp::{PacketSink, UdpSink};
