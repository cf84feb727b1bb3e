use super::Attribute;
use crate::{Error, Message, MessageBuilder, NE};
use bitfield::bitfield;
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::str::from_utf8;

bitfield! {
    struct ErrorCodeHead(u32);

    number, set_number: 7, 0;
    class, set_class: 11, 8;
}

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub number: u32,
    pub reason: String,
}

impl ErrorCode {
    pub const UNAUTHORIZED: u32 = 401;
    pub const ROLE_CONFLICT: u32 = 487;
    pub const STALE_NONCE: u32 = 438;

    pub fn new(number: u32, reason: impl Into<String>) -> Self {
        Self {
            number,
            reason: reason.into(),
        }
    }
}

impl Attribute for ErrorCode {
    const TYPE: u16 = 0x0009;

    fn decode(_: &Message, mut value: &[u8]) -> Result<Self, Error> {
        if value.len() < 4 {
            return Err(Error::InvalidData("error code must be at least 4 bytes"));
        }

        let head = ErrorCodeHead(value.read_u32::<NE>()?);

        Ok(Self {
            number: head.class() * 100 + head.number(),
            reason: from_utf8(value)?.to_string(),
        })
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        let mut head = ErrorCodeHead(0);
        head.set_class(self.number / 100);
        head.set_number(self.number % 100);

        builder.buffer().put_u32(head.0);
        builder.buffer().extend_from_slice(self.reason.as_bytes());
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(u16::try_from(4 + self.reason.len())?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Class, Method, TransactionId};

    #[test]
    fn error_code() {
        let mut builder =
            MessageBuilder::new(Class::Error, Method::Binding, TransactionId::new([0; 12]));
        builder.add_attr(&ErrorCode::new(ErrorCode::ROLE_CONFLICT, "Role Conflict"));

        let msg = Message::parse(builder.finish().unwrap()).unwrap();
        let err = msg.attribute::<ErrorCode>().unwrap().unwrap();

        assert_eq!(err.number, 487);
        assert_eq!(err.reason, "Role Conflict");
    }
}
