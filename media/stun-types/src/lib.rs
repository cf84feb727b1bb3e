//! STUN/TURN message codec
//!
//! Owned message parsing & building for the subset of
//! [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489) and
//! [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766) needed for ICE connectivity checks,
//! server reflexive candidate discovery and TURN relay allocations.

use byteorder::ReadBytesExt;
use header::MessageHead;
use std::fmt;
use std::io::{self, Cursor};
use std::num::TryFromIntError;
use std::str::Utf8Error;

pub mod attributes;
mod builder;
mod header;
mod parse;

pub use builder::MessageBuilder;
pub use header::{Class, Method};
pub use parse::Message;

type NE = byteorder::NetworkEndian;

/// Magic cookie contained in every STUN message
pub const COOKIE: u32 = 0x2112A442;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input data, {0}")]
    InvalidData(&'static str),
    #[error("failed to convert integer")]
    TryFromInt(#[from] TryFromIntError),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::InvalidData("buffer seems incomplete"),
            _ => Self::InvalidData("failed to read from buffer"),
        }
    }
}

/// 96 bit STUN transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn new(v: [u8; 12]) -> Self {
        Self(v)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }

        Ok(())
    }
}

fn padding_usize(n: usize) -> usize {
    (4 - n % 4) % 4
}

/// Return value of [`is_stun_message`]
#[derive(Debug, PartialEq, Eq)]
pub enum IsStunMessageInfo {
    /// Message is shorter than 20 bytes (STUN message header length),
    /// making it impossible to check.
    TooShort,

    /// Buffer does not contain a STUN message.
    No,

    /// Buffer contains a STUN message.
    /// Variant contains the remaining amount of bytes.
    Yes { remaining: usize },

    /// Buffer contains a STUN message, but its incomplete.
    /// Variant contains the needed amount of bytes message.
    YesIncomplete { needed: usize },
}

/// Inspect the given input to find out if it contains a STUN message.
///
/// Used to demultiplex STUN from DTLS/RTP traffic on the same socket. Does not perform any
/// kind of searching, to detect the STUN message it must begin at the start of the input.
pub fn is_stun_message(i: &[u8]) -> IsStunMessageInfo {
    if i.len() < header::STUN_HEADER_LENGTH {
        return IsStunMessageInfo::TooShort;
    }

    let mut cursor = Cursor::new(i);

    let (Ok(head), Ok(cookie)) = (cursor.read_u32::<NE>(), cursor.read_u32::<NE>()) else {
        return IsStunMessageInfo::TooShort;
    };

    let head = MessageHead(head);

    if head.z() != 0 || cookie != COOKIE {
        return IsStunMessageInfo::No;
    }

    let expected_msg_len = usize::from(head.len()) + header::STUN_HEADER_LENGTH;

    if i.len() < expected_msg_len {
        IsStunMessageInfo::YesIncomplete {
            needed: expected_msg_len - i.len(),
        }
    } else {
        IsStunMessageInfo::Yes {
            remaining: i.len() - expected_msg_len,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detect_stun_message() {
        let builder = MessageBuilder::new(Class::Request, Method::Binding, TransactionId::random());
        let bytes = builder.finish().unwrap();

        assert_eq!(is_stun_message(&bytes), IsStunMessageInfo::Yes { remaining: 0 });
        assert_eq!(is_stun_message(&bytes[..10]), IsStunMessageInfo::TooShort);
    }

    #[test]
    fn reject_dtls_record() {
        // DTLS 1.2 handshake record header followed by garbage
        let mut record = vec![22, 254, 253, 0, 0, 0, 0, 0, 0, 0, 0, 0, 100];
        record.resize(40, 0);

        assert_eq!(is_stun_message(&record), IsStunMessageInfo::No);
    }

    #[test]
    fn padding() {
        assert_eq!(padding_usize(0), 0);
        assert_eq!(padding_usize(1), 3);
        assert_eq!(padding_usize(2), 2);
        assert_eq!(padding_usize(3), 1);
        assert_eq!(padding_usize(8), 0);
    }
}
