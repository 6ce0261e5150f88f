//! IPMSG protocol constants and flag handling.
//!
//! The numeric values below are the historical IPMSG wire codes and must not
//! change: every client on the LAN interprets them identically. The low byte
//! of the 32-bit flags word is the command, the remaining bits are options.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version written as the first field of every packet
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known IPMSG UDP/TCP port
pub const DEFAULT_PORT: u16 = 2425;

/// Smallest receive buffer any IPMSG client is expected to provide
pub const MIN_UDP_BUFFER: usize = 8192;

/// Largest datagram the engine will emit
pub const MAX_UDP_BUFFER: usize = 65507;

/// Mask selecting the command byte out of a flags word
pub const COMMAND_MASK: u32 = 0x0000_00ff;

/// Mask selecting the option bits out of a flags word
pub const OPTION_MASK: u32 = 0xffff_ff00;

/// Command codes (low byte of the flags word)
pub mod command {
    /// No operation
    pub const NOOPERATION: u32 = 0x0000_0000;
    /// Presence broadcast on startup
    pub const BR_ENTRY: u32 = 0x0000_0001;
    /// Presence broadcast on shutdown
    pub const BR_EXIT: u32 = 0x0000_0002;
    /// Unicast answer to BR_ENTRY
    pub const ANSENTRY: u32 = 0x0000_0003;
    /// Absence state change broadcast
    pub const BR_ABSENCE: u32 = 0x0000_0004;
    /// "Is anyone serving host lists?"
    pub const BR_ISGETLIST: u32 = 0x0000_0010;
    /// "I serve host lists"
    pub const OKGETLIST: u32 = 0x0000_0011;
    /// Host list page request
    pub const GETLIST: u32 = 0x0000_0012;
    /// Host list page answer
    pub const ANSLIST: u32 = 0x0000_0013;
    /// Second-generation host list request
    pub const BR_ISGETLIST2: u32 = 0x0000_0018;
    /// Chat message
    pub const SENDMSG: u32 = 0x0000_0020;
    /// Delivery acknowledgement
    pub const RECVMSG: u32 = 0x0000_0021;
    /// Sealed message opened
    pub const READMSG: u32 = 0x0000_0030;
    /// Sealed message discarded unread
    pub const DELMSG: u32 = 0x0000_0031;
    /// Acknowledgement of READMSG
    pub const ANSREADMSG: u32 = 0x0000_0032;
    /// Version information request
    pub const GETINFO: u32 = 0x0000_0040;
    /// Version information answer
    pub const SENDINFO: u32 = 0x0000_0041;
    /// Absence text request
    pub const GETABSENCEINFO: u32 = 0x0000_0050;
    /// Absence text answer
    pub const SENDABSENCEINFO: u32 = 0x0000_0051;
    /// Attachment download request (TCP)
    pub const GETFILEDATA: u32 = 0x0000_0060;
    /// Attachments no longer wanted
    pub const RELEASEFILES: u32 = 0x0000_0061;
    /// Directory attachment download request (TCP)
    pub const GETDIRFILES: u32 = 0x0000_0062;
    /// Public key request
    pub const GETPUBKEY: u32 = 0x0000_0072;
    /// Public key answer
    pub const ANSPUBKEY: u32 = 0x0000_0073;
}

/// Option bits (upper 24 bits of the flags word)
pub mod option {
    /// Sender is absent
    pub const ABSENCEOPT: u32 = 0x0000_0100;
    /// Sender is a host-list server
    pub const SERVEROPT: u32 = 0x0000_0200;
    /// Sender is on a dial-up link (unreachable by broadcast)
    pub const DIALUPOPT: u32 = 0x0001_0000;
    /// Sender supports file attachments
    pub const FILEATTACHOPT: u32 = 0x0020_0000;
    /// Sender supports / message uses encryption
    pub const ENCRYPTOPT: u32 = 0x0040_0000;
    /// Message text is UTF-8
    pub const UTF8OPT: u32 = 0x0080_0000;
    /// Sender understands UTF-8
    pub const CAPUTF8OPT: u32 = 0x0100_0000;
    /// Extension field is encrypted as well
    pub const ENCEXTMSGOPT: u32 = 0x0400_0000;
    /// Sender supports clipboard images
    pub const CLIPBOARDOPT: u32 = 0x0800_0000;

    /// Receiver must acknowledge with RECVMSG
    pub const SENDCHECKOPT: u32 = 0x0000_0100;
    /// Sealed message
    pub const SECRETOPT: u32 = 0x0000_0200;
    /// Sent to a broadcast address
    pub const BROADCASTOPT: u32 = 0x0000_0400;
    /// Sent to a multicast group
    pub const MULTICASTOPT: u32 = 0x0000_0800;
    /// Do not pop up a window on arrival
    pub const NOPOPUPOPT: u32 = 0x0000_1000;
    /// Automatic reply (absence answer)
    pub const AUTORETOPT: u32 = 0x0000_2000;
    /// Retransmission
    pub const RETRYOPT: u32 = 0x0000_4000;
    /// Locked with a password
    pub const PASSWORDOPT: u32 = 0x0000_8000;
    /// Do not write to the message log
    pub const NOLOGOPT: u32 = 0x0002_0000;
    /// New multicast convention
    pub const NEWMUTIOPT: u32 = 0x0004_0000;
    /// Do not add the sender to the host list
    pub const NOADDLISTOPT: u32 = 0x0008_0000;
    /// Sender wants a READMSG answer
    pub const READCHECKOPT: u32 = 0x0010_0000;
    /// Sealed message with read check
    pub const SECRETEXOPT: u32 = READCHECKOPT | SECRETOPT;

    /// Options that forbid any automatic answer
    pub const NO_REPLY_OPTS: u32 = BROADCASTOPT | AUTORETOPT;
}

/// Crypto capability bits exchanged through GETPUBKEY/ANSPUBKEY and the envelope
pub mod crypto_cap {
    /// RSA 512-bit
    pub const RSA_512: u32 = 0x0000_0001;
    /// RSA 1024-bit
    pub const RSA_1024: u32 = 0x0000_0002;
    /// RSA 2048-bit
    pub const RSA_2048: u32 = 0x0000_0004;
    /// RC2 40-bit
    pub const RC2_40: u32 = 0x0000_1000;
    /// RC2 128-bit
    pub const RC2_128: u32 = 0x0000_4000;
    /// RC2 256-bit
    pub const RC2_256: u32 = 0x0000_8000;
    /// Blowfish 128-bit
    pub const BLOWFISH_128: u32 = 0x0002_0000;
    /// Blowfish 256-bit
    pub const BLOWFISH_256: u32 = 0x0004_0000;
    /// AES 128-bit
    pub const AES_128: u32 = 0x0010_0000;
    /// AES 192-bit
    pub const AES_192: u32 = 0x0020_0000;
    /// AES 256-bit
    pub const AES_256: u32 = 0x0040_0000;
    /// RSA signature over an MD5 digest
    pub const SIGN_MD5: u32 = 0x1000_0000;
    /// RSA signature over a SHA-1 digest
    pub const SIGN_SHA1: u32 = 0x2000_0000;

    /// Every asymmetric bit
    pub const ASYMMETRIC_MASK: u32 = RSA_512 | RSA_1024 | RSA_2048;
    /// Every symmetric bit
    pub const SYMMETRIC_MASK: u32 = RC2_40
        | RC2_128
        | RC2_256
        | BLOWFISH_128
        | BLOWFISH_256
        | AES_128
        | AES_192
        | AES_256;
    /// Every signature bit
    pub const SIGNATURE_MASK: u32 = SIGN_MD5 | SIGN_SHA1;
}

/// A flags word: command in the low byte, options above it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CommandFlags(u32);

impl CommandFlags {
    /// Wrap a raw flags word
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Build a flags word from a command and its options
    pub const fn new(command: u32, options: u32) -> Self {
        Self((command & COMMAND_MASK) | (options & OPTION_MASK))
    }

    /// The raw 32-bit value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The command byte
    pub const fn command(self) -> u32 {
        self.0 & COMMAND_MASK
    }

    /// The option bits
    pub const fn options(self) -> u32 {
        self.0 & OPTION_MASK
    }

    /// True if any bit of `opt` is set
    pub const fn has(self, opt: u32) -> bool {
        self.0 & opt & OPTION_MASK != 0
    }

    /// Returns a copy with `opt` set
    #[must_use]
    pub const fn with(self, opt: u32) -> Self {
        Self(self.0 | (opt & OPTION_MASK))
    }

    /// Returns a copy with `opt` cleared
    #[must_use]
    pub const fn without(self, opt: u32) -> Self {
        Self(self.0 & !(opt & OPTION_MASK))
    }

    /// The classified command
    pub fn kind(self) -> Command {
        Command::from_code(self.command())
    }
}

impl fmt::Display for CommandFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{:#x}", self.kind(), self.options())
    }
}

/// Every command the dispatcher distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// NOOPERATION
    NoOperation,
    /// BR_ENTRY
    BrEntry,
    /// BR_EXIT
    BrExit,
    /// ANSENTRY
    AnsEntry,
    /// BR_ABSENCE
    BrAbsence,
    /// BR_ISGETLIST
    BrIsGetList,
    /// OKGETLIST
    OkGetList,
    /// GETLIST
    GetList,
    /// ANSLIST
    AnsList,
    /// BR_ISGETLIST2
    BrIsGetList2,
    /// SENDMSG
    SendMsg,
    /// RECVMSG
    RecvMsg,
    /// READMSG
    ReadMsg,
    /// DELMSG
    DelMsg,
    /// ANSREADMSG
    AnsReadMsg,
    /// GETINFO
    GetInfo,
    /// SENDINFO
    SendInfo,
    /// GETABSENCEINFO
    GetAbsenceInfo,
    /// SENDABSENCEINFO
    SendAbsenceInfo,
    /// RELEASEFILES
    ReleaseFiles,
    /// GETPUBKEY
    GetPubKey,
    /// ANSPUBKEY
    AnsPubKey,
    /// Anything else, including the TCP-only file commands
    Unknown(u32),
}

impl Command {
    /// Classify a command byte
    pub fn from_code(code: u32) -> Self {
        match code {
            command::NOOPERATION => Self::NoOperation,
            command::BR_ENTRY => Self::BrEntry,
            command::BR_EXIT => Self::BrExit,
            command::ANSENTRY => Self::AnsEntry,
            command::BR_ABSENCE => Self::BrAbsence,
            command::BR_ISGETLIST => Self::BrIsGetList,
            command::OKGETLIST => Self::OkGetList,
            command::GETLIST => Self::GetList,
            command::ANSLIST => Self::AnsList,
            command::BR_ISGETLIST2 => Self::BrIsGetList2,
            command::SENDMSG => Self::SendMsg,
            command::RECVMSG => Self::RecvMsg,
            command::READMSG => Self::ReadMsg,
            command::DELMSG => Self::DelMsg,
            command::ANSREADMSG => Self::AnsReadMsg,
            command::GETINFO => Self::GetInfo,
            command::SENDINFO => Self::SendInfo,
            command::GETABSENCEINFO => Self::GetAbsenceInfo,
            command::SENDABSENCEINFO => Self::SendAbsenceInfo,
            command::RELEASEFILES => Self::ReleaseFiles,
            command::GETPUBKEY => Self::GetPubKey,
            command::ANSPUBKEY => Self::AnsPubKey,
            other => Self::Unknown(other),
        }
    }

    /// Whether the command is meant for broadcast addressing
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            Self::BrEntry | Self::BrExit | Self::BrAbsence | Self::BrIsGetList | Self::BrIsGetList2
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "UNKNOWN({code:#x})"),
            other => write!(f, "{}", format!("{other:?}").to_uppercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_and_options_split() {
        let flags = CommandFlags::new(
            command::SENDMSG,
            option::SENDCHECKOPT | option::ENCRYPTOPT | option::SECRETOPT,
        );
        assert_eq!(flags.command(), command::SENDMSG);
        assert_eq!(flags.kind(), Command::SendMsg);
        assert!(flags.has(option::ENCRYPTOPT));
        assert!(flags.has(option::SENDCHECKOPT));
        assert!(!flags.has(option::NOLOGOPT));
        assert_eq!(flags.raw(), 0x0040_0320);
    }

    #[test]
    fn test_option_bits_do_not_leak_into_command() {
        let flags = CommandFlags::new(command::BR_ENTRY, 0xffff_ffff);
        assert_eq!(flags.command(), command::BR_ENTRY);
        let cleared = flags.without(option::ENCRYPTOPT);
        assert!(!cleared.has(option::ENCRYPTOPT));
        assert_eq!(cleared.command(), command::BR_ENTRY);
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(Command::from_code(0x99), Command::Unknown(0x99));
        assert_eq!(Command::from_code(command::GETFILEDATA), Command::Unknown(0x60));
        assert_eq!(Command::from_code(command::ANSPUBKEY), Command::AnsPubKey);
    }

    #[test]
    fn test_broadcast_commands() {
        assert!(Command::BrEntry.is_broadcast());
        assert!(Command::BrIsGetList2.is_broadcast());
        assert!(!Command::SendMsg.is_broadcast());
        assert!(!Command::AnsEntry.is_broadcast());
    }

    #[test]
    fn test_capability_masks_are_disjoint() {
        use crypto_cap::*;
        assert_eq!(ASYMMETRIC_MASK & SYMMETRIC_MASK, 0);
        assert_eq!(SYMMETRIC_MASK & SIGNATURE_MASK, 0);
        assert_eq!(ASYMMETRIC_MASK & SIGNATURE_MASK, 0);
    }
}
