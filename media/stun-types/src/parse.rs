use crate::attributes::{
    ATTRIBUTE_HEADER_LEN, Attribute, FINGERPRINT_TYPE, MESSAGE_INTEGRITY_TYPE, fingerprint_crc,
    hmac_sha1,
};
use crate::header::{Class, MessageHead, Method, STUN_HEADER_LENGTH};
use crate::{COOKIE, Error, NE, TransactionId, padding_usize};
use byteorder::ReadBytesExt;
use bytes::Buf;
use std::io::{Cursor, Read};

#[derive(Debug, Clone, Copy)]
pub(crate) struct AttrSpan {
    /// Index where the attribute's value begins
    begin: usize,

    /// Index of end of the attribute's value
    end: usize,

    /// End of the attribute's value including padding
    padding_end: usize,

    /// Attribute type id
    typ: u16,
}

/// Parsed STUN message
#[derive(Debug, Clone)]
pub struct Message {
    buffer: Vec<u8>,
    class: Class,
    method: Method,
    transaction_id: TransactionId,
    attributes: Vec<AttrSpan>,
}

impl Message {
    pub fn parse(buffer: impl Into<Vec<u8>>) -> Result<Message, Error> {
        let mut cursor = Cursor::new(buffer.into());

        let head = MessageHead(cursor.read_u32::<NE>()?);

        if head.z() != 0 {
            return Err(Error::InvalidData("not a stun message"));
        }

        if cursor.read_u32::<NE>()? != COOKIE {
            return Err(Error::InvalidData("not a stun message"));
        }

        let mut transaction_id = [0u8; 12];
        cursor.read_exact(&mut transaction_id)?;

        let class = Class::from_typ(head.typ());
        let method = Method::from_typ(head.typ())?;

        let msg_end = STUN_HEADER_LENGTH + usize::from(head.len());

        if msg_end > cursor.get_ref().len() {
            return Err(Error::InvalidData("buffer seems incomplete"));
        }

        // ignore everything after the announced length
        cursor.get_mut().truncate(msg_end);

        let mut attributes = vec![];

        while cursor.has_remaining() {
            let attr_typ = cursor.read_u16::<NE>()?;
            let attr_len = usize::from(cursor.read_u16::<NE>()?);
            let padding = padding_usize(attr_len);

            let value_begin = usize::try_from(cursor.position())?;
            let value_end = value_begin + attr_len;
            let padding_end = value_end + padding;

            if padding_end > cursor.get_ref().len() {
                return Err(Error::InvalidData(
                    "invalid attribute length in STUN message",
                ));
            }

            attributes.push(AttrSpan {
                begin: value_begin,
                end: value_end,
                padding_end,
                typ: attr_typ,
            });

            cursor.set_position(u64::try_from(padding_end)?);
        }

        Ok(Message {
            buffer: cursor.into_inner(),
            class,
            method,
            transaction_id: TransactionId::new(transaction_id),
            attributes,
        })
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Return the raw message
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Attributes which are covered by the message integrity (if any)
    fn covered_attributes(&self) -> impl Iterator<Item = AttrSpan> + '_ {
        let mut after_integrity = false;

        self.attributes.iter().copied().filter(move |attr| {
            if after_integrity {
                // only the fingerprint may follow the message integrity
                return attr.typ == FINGERPRINT_TYPE;
            }

            if attr.typ == MESSAGE_INTEGRITY_TYPE {
                after_integrity = true;
            }

            true
        })
    }

    /// Try to read an attribute from the message
    pub fn attribute<A: Attribute>(&self) -> Option<Result<A, Error>> {
        self.covered_attributes()
            .find(|attr| attr.typ == A::TYPE)
            .map(|attr| A::decode(self, &self.buffer[attr.begin..attr.end]))
    }

    /// Returns if the message contains the given attribute
    pub fn has_attribute<A: Attribute>(&self) -> bool {
        self.covered_attributes().any(|attr| attr.typ == A::TYPE)
    }

    /// Verify the MESSAGE-INTEGRITY attribute with the given key
    ///
    /// Returns false if the message has no integrity attribute
    pub fn verify_integrity(&self, key: &[u8]) -> bool {
        let Some(attr) = self
            .attributes
            .iter()
            .find(|attr| attr.typ == MESSAGE_INTEGRITY_TYPE)
        else {
            return false;
        };

        let received_digest = &self.buffer[attr.begin..attr.end];

        // The text used as input to HMAC is the STUN message, up to and
        // including the attribute preceding the MESSAGE-INTEGRITY attribute,
        // with the length pointing to the end of the MESSAGE-INTEGRITY attribute.
        let Some(message) = self.prefix_with_len(attr.begin - ATTRIBUTE_HEADER_LEN, attr.padding_end) else {
            return false;
        };

        match hmac_sha1(key, &message) {
            Ok(digest) => digest.as_slice() == received_digest,
            Err(_) => false,
        }
    }

    /// Verify the FINGERPRINT attribute, returns false if the message has no fingerprint
    pub fn verify_fingerprint(&self) -> bool {
        let Some(attr) = self
            .attributes
            .iter()
            .find(|attr| attr.typ == FINGERPRINT_TYPE)
        else {
            return false;
        };

        let mut value = &self.buffer[attr.begin..attr.end];

        let Ok(received_crc) = value.read_u32::<NE>() else {
            return false;
        };

        let Some(message) = self.prefix_with_len(attr.begin - ATTRIBUTE_HEADER_LEN, attr.padding_end) else {
            return false;
        };

        fingerprint_crc(&message) == received_crc
    }

    /// Copy the message up to `end` with the header's length set to point to `len_end`
    fn prefix_with_len(&self, end: usize, len_end: usize) -> Option<Vec<u8>> {
        let len = u16::try_from(len_end - STUN_HEADER_LENGTH).ok()?;

        let mut message = self.buffer[..end].to_vec();
        message[2..4].copy_from_slice(&len.to_be_bytes());

        Some(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MessageBuilder;
    use crate::attributes::{Software, Username, XorMappedAddress};
    use std::net::SocketAddr;

    fn make_message(password: &str) -> Vec<u8> {
        let mut builder = MessageBuilder::new(
            Class::Request,
            Method::Binding,
            TransactionId::new([7; 12]),
        );
        builder.add_attr(&Username::new("remote:local"));
        builder.add_message_integrity(password.as_bytes());
        builder.add_fingerprint();
        builder.finish().unwrap()
    }

    #[test]
    fn integrity_and_fingerprint() {
        let msg = Message::parse(make_message("abc123")).unwrap();

        assert_eq!(msg.class(), Class::Request);
        assert_eq!(msg.method(), Method::Binding);
        assert_eq!(msg.transaction_id(), TransactionId::new([7; 12]));
        assert!(msg.verify_integrity(b"abc123"));
        assert!(!msg.verify_integrity(b"wrong"));
        assert!(msg.verify_fingerprint());

        let username = msg.attribute::<Username>().unwrap().unwrap();
        assert_eq!(username.0, "remote:local");
    }

    #[test]
    fn tampered_message() {
        let mut bytes = make_message("abc123");
        // flip a bit inside the username
        bytes[25] ^= 1;

        let msg = Message::parse(bytes).unwrap();

        assert!(!msg.verify_integrity(b"abc123"));
        assert!(!msg.verify_fingerprint());
    }

    #[test]
    fn attributes_after_integrity_are_ignored() {
        let mut builder = MessageBuilder::new(
            Class::Success,
            Method::Binding,
            TransactionId::random(),
        );
        builder.add_message_integrity(b"pwd");
        builder.add_attr(&Software::new("late"));
        builder.add_attr(&XorMappedAddress("10.0.0.1:5000".parse::<SocketAddr>().unwrap()));

        let msg = Message::parse(builder.finish().unwrap()).unwrap();

        assert!(msg.attribute::<Software>().is_none());
        assert!(!msg.has_attribute::<XorMappedAddress>());
        assert!(msg.verify_integrity(b"pwd"));
    }

    #[test]
    fn truncated_message() {
        let bytes = make_message("abc123");

        assert!(Message::parse(&bytes[..bytes.len() - 3]).is_err());
        assert!(Message::parse(&bytes[..12]).is_err());
    }
}
