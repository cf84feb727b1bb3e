//! STUN/TURN attributes
//!
//! MESSAGE-INTEGRITY and FINGERPRINT are not modeled as attributes, they are added using
//! [`MessageBuilder::add_message_integrity`] / [`MessageBuilder::add_fingerprint`] and verified
//! using [`Message::verify_integrity`] / [`Message::verify_fingerprint`].

use crate::{Error, Message, MessageBuilder, NE};
use byteorder::ReadBytesExt;
use bytes::BufMut;
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::str::from_utf8;

mod addr;
mod error_code;
mod ice;
mod turn;

pub use addr::{XorMappedAddress, XorPeerAddress, XorRelayedAddress};
pub use error_code::ErrorCode;
pub use ice::{IceControlled, IceControlling, Priority, UseCandidate};
pub use turn::{Data, Lifetime, RequestedTransport};

pub(crate) const ATTRIBUTE_HEADER_LEN: usize = 4;
pub(crate) const MESSAGE_INTEGRITY_TYPE: u16 = 0x0008;
pub(crate) const FINGERPRINT_TYPE: u16 = 0x8028;

const FINGERPRINT_XOR: u32 = 0x5354554e;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A STUN attribute with a fixed type id
pub trait Attribute: Sized {
    const TYPE: u16;

    /// Decode the attribute from its value (excluding padding)
    fn decode(msg: &Message, value: &[u8]) -> Result<Self, Error>;

    /// Write the attribute's value into the builder
    fn encode(&self, builder: &mut MessageBuilder);

    /// Length of the attribute's value (excluding padding)
    fn encode_len(&self) -> Result<u16, Error>;
}

/// Key used for the long-term credential mechanism: `MD5(username ":" realm ":" password)`
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    md5::compute(format!("{username}:{realm}:{password}").as_bytes()).to_vec()
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; 20], Error> {
    let mut hmac = Hmac::<Sha1>::new_from_slice(key)
        .map_err(|_| Error::InvalidData("invalid message integrity key"))?;

    hmac.update(data);

    Ok(hmac.finalize().into_bytes().into())
}

pub(crate) fn fingerprint_crc(data: &[u8]) -> u32 {
    CRC32.checksum(data) ^ FINGERPRINT_XOR
}

macro_rules! string_attribute {
    ($(#[$meta:meta])* $name:ident, $typ:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
        }

        impl Attribute for $name {
            const TYPE: u16 = $typ;

            fn decode(_: &Message, value: &[u8]) -> Result<Self, Error> {
                Ok(Self(from_utf8(value)?.to_string()))
            }

            fn encode(&self, builder: &mut MessageBuilder) {
                builder.buffer().extend_from_slice(self.0.as_bytes());
            }

            fn encode_len(&self) -> Result<u16, Error> {
                Ok(u16::try_from(self.0.len())?)
            }
        }
    };
}

string_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.3)
    Username,
    0x0006
);

string_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.9)
    Realm,
    0x0014
);

string_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.10)
    Nonce,
    0x0015
);

string_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.14)
    Software,
    0x8022
);

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.13)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAttributes(pub Vec<u16>);

impl Attribute for UnknownAttributes {
    const TYPE: u16 = 0x000A;

    fn decode(_: &Message, mut value: &[u8]) -> Result<Self, Error> {
        let mut attributes = vec![];

        while !value.is_empty() {
            attributes.push(value.read_u16::<NE>()?);
        }

        Ok(Self(attributes))
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        for &attr in &self.0 {
            builder.buffer().put_u16(attr);
        }
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(u16::try_from(self.0.len() * 2)?)
    }
}
