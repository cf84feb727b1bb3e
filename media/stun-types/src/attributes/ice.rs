//! ICE attributes [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-16.1)

use super::Attribute;
use crate::{Error, Message, MessageBuilder, NE};
use byteorder::ReadBytesExt;
use bytes::BufMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority(pub u32);

impl Attribute for Priority {
    const TYPE: u16 = 0x0024;

    fn decode(_: &Message, mut value: &[u8]) -> Result<Self, Error> {
        if value.len() != 4 {
            return Err(Error::InvalidData("priority value must be 4 bytes"));
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseCandidate;

impl Attribute for UseCandidate {
    const TYPE: u16 = 0x0025;

    fn decode(_: &Message, _: &[u8]) -> Result<Self, Error> {
        Ok(Self)
    }

    fn encode(&self, _: &mut MessageBuilder) {}

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(0)
    }
}

macro_rules! tie_breaker_attribute {
    ($name:ident, $typ:expr) => {
        /// Contains the tie-breaker of the agent
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub u64);

        impl Attribute for $name {
            const TYPE: u16 = $typ;

            fn decode(_: &Message, mut value: &[u8]) -> Result<Self, Error> {
                if value.len() != 8 {
                    return Err(Error::InvalidData("tie-breaker value must be 8 bytes"));
                }

                Ok(Self(value.read_u64::<NE>()?))
            }

            fn encode(&self, builder: &mut MessageBuilder) {
                builder.buffer().put_u64(self.0);
            }

            fn encode_len(&self) -> Result<u16, Error> {
                Ok(8)
            }
        }
    };
}

tie_breaker_attribute!(IceControlled, 0x8029);
tie_breaker_attribute!(IceControlling, 0x802A);

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Class, Method, TransactionId};

    #[test]
    fn binding_request_attributes() {
        let mut builder =
            MessageBuilder::new(Class::Request, Method::Binding, TransactionId::random());
        builder.add_attr(&Priority(1862270975));
        builder.add_attr(&IceControlling(0xDEAD_BEEF_1234));
        builder.add_attr(&UseCandidate);

        let msg = Message::parse(builder.finish().unwrap()).unwrap();

        assert_eq!(msg.attribute::<Priority>().unwrap().unwrap().0, 1862270975);
        assert_eq!(
            msg.attribute::<IceControlling>().unwrap().unwrap().0,
            0xDEAD_BEEF_1234
        );
        assert!(msg.has_attribute::<UseCandidate>());
        assert!(!msg.has_attribute::<IceControlled>());
    }
}
