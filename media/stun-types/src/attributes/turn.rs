//! TURN attributes [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14)

use super::Attribute;
use crate::{Error, Message, MessageBuilder, NE};
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::time::Duration;

/// Lifetime of an allocation or permission in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime(pub u32);

impl Lifetime {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.0))
    }
}

impl Attribute for Lifetime {
    const TYPE: u16 = 0x000D;

    fn decode(_: &Message, mut value: &[u8]) -> Result<Self, Error> {
        if value.len() != 4 {
            return Err(Error::InvalidData("lifetime value must be 4 bytes"));
        }

        Ok(Self(value.read_u32::<NE>()?))
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        builder.buffer().put_u32(self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

/// Transport protocol to allocate, followed by 3 bytes RFFU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedTransport {
    pub protocol_number: u8,
}

impl RequestedTransport {
    pub const UDP: Self = Self {
        protocol_number: 17,
    };
}

impl Attribute for RequestedTransport {
    const TYPE: u16 = 0x0019;

    fn decode(_: &Message, mut value: &[u8]) -> Result<Self, Error> {
        if value.len() != 4 {
            return Err(Error::InvalidData("requested transport value must be 4 bytes"));
        }

        Ok(Self {
            protocol_number: value.read_u8()?,
        })
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        builder.buffer().put_u8(self.protocol_number);
        builder.buffer().put_slice(&[0, 0, 0]);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

/// Application data of Send & Data indications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

impl Attribute for Data {
    const TYPE: u16 = 0x0013;

    fn decode(_: &Message, value: &[u8]) -> Result<Self, Error> {
        Ok(Self(value.to_vec()))
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        builder.buffer().put_slice(&self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(u16::try_from(self.0.len())?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attributes::{Nonce, Realm, Username, XorPeerAddress, long_term_key};
    use crate::{Class, Method, TransactionId};

    #[test]
    fn authenticated_allocate_request() {
        let key = long_term_key("user", "example.org", "secret");

        let mut builder =
            MessageBuilder::new(Class::Request, Method::Allocate, TransactionId::random());
        builder.add_attr(&RequestedTransport::UDP);
        builder.add_attr(&Lifetime(600));
        builder.add_attr(&Username::new("user"));
        builder.add_attr(&Realm::new("example.org"));
        builder.add_attr(&Nonce::new("f00b4r"));
        builder.add_message_integrity(&key);

        let msg = Message::parse(builder.finish().unwrap()).unwrap();

        assert_eq!(msg.method(), Method::Allocate);
        assert_eq!(
            msg.attribute::<RequestedTransport>().unwrap().unwrap(),
            RequestedTransport::UDP
        );
        assert_eq!(
            msg.attribute::<Lifetime>().unwrap().unwrap().duration(),
            Duration::from_secs(600)
        );
        assert!(msg.verify_integrity(&key));
    }

    #[test]
    fn send_indication() {
        let peer = "198.51.100.4:6000".parse().unwrap();

        let mut builder =
            MessageBuilder::new(Class::Indication, Method::Send, TransactionId::random());
        builder.add_attr(&XorPeerAddress(peer));
        builder.add_attr(&Data(vec![1, 2, 3, 4, 5]));

        let msg = Message::parse(builder.finish().unwrap()).unwrap();

        assert_eq!(msg.attribute::<XorPeerAddress>().unwrap().unwrap().0, peer);
        assert_eq!(msg.attribute::<Data>().unwrap().unwrap().0, [1, 2, 3, 4, 5]);
    }
}
