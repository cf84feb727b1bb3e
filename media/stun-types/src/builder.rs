use crate::attributes::{
    ATTRIBUTE_HEADER_LEN, Attribute, FINGERPRINT_TYPE, MESSAGE_INTEGRITY_TYPE, fingerprint_crc,
    hmac_sha1,
};
use crate::header::{Class, MessageHead, Method, STUN_HEADER_LENGTH};
use crate::{COOKIE, Error, TransactionId, padding_usize};
use bytes::BufMut;

/// Builder for a STUN message
///
/// Encoding errors (e.g. oversized attributes) are remembered and returned by [`finish`](Self::finish).
pub struct MessageBuilder {
    head: MessageHead,
    transaction_id: TransactionId,
    buffer: Vec<u8>,
    error: Option<Error>,
}

impl MessageBuilder {
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        let head = MessageHead::new(class, method);

        let mut buffer = Vec::with_capacity(128);
        buffer.put_u32(head.0);
        buffer.put_u32(COOKIE);
        buffer.put_slice(transaction_id.as_bytes());

        Self {
            head,
            transaction_id,
            buffer,
            error: None,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Serialize the attribute into the builder
    pub fn add_attr<A: Attribute>(&mut self, attr: &A) {
        let enc_len = match attr.encode_len() {
            Ok(enc_len) => enc_len,
            Err(e) => {
                self.error.get_or_insert(e);
                return;
            }
        };

        self.buffer.put_u16(A::TYPE);
        self.buffer.put_u16(enc_len);

        attr.encode(self);

        let padding = padding_usize(usize::from(enc_len));
        self.buffer.extend(std::iter::repeat_n(0, padding));
    }

    /// Add a MESSAGE-INTEGRITY attribute using the given key
    ///
    /// For short-term credentials the key is the password, for long-term credentials see
    /// [`long_term_key`](crate::attributes::long_term_key).
    pub fn add_message_integrity(&mut self, key: &[u8]) {
        // length must include the integrity attribute itself
        if let Err(e) = self.set_len_with_trailing_attr(20) {
            self.error.get_or_insert(e);
            return;
        }

        let digest = match hmac_sha1(key, &self.buffer) {
            Ok(digest) => digest,
            Err(e) => {
                self.error.get_or_insert(e);
                return;
            }
        };

        self.buffer.put_u16(MESSAGE_INTEGRITY_TYPE);
        self.buffer.put_u16(20);
        self.buffer.put_slice(&digest);
    }

    /// Add a FINGERPRINT attribute, must be the last attribute of the message
    pub fn add_fingerprint(&mut self) {
        if let Err(e) = self.set_len_with_trailing_attr(4) {
            self.error.get_or_insert(e);
            return;
        }

        let crc = fingerprint_crc(&self.buffer);

        self.buffer.put_u16(FINGERPRINT_TYPE);
        self.buffer.put_u16(4);
        self.buffer.put_u32(crc);
    }

    fn set_len_with_trailing_attr(&mut self, value_len: usize) -> Result<(), Error> {
        let len = self.buffer.len() + ATTRIBUTE_HEADER_LEN + value_len - STUN_HEADER_LENGTH;
        self.set_len(u16::try_from(len)?);
        Ok(())
    }

    fn set_len(&mut self, len: u16) {
        self.head.set_len(len);
        self.buffer[..4].copy_from_slice(&self.head.0.to_be_bytes());
    }

    pub(crate) fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let len = u16::try_from(self.buffer.len() - STUN_HEADER_LENGTH)?;
        self.set_len(len);

        Ok(self.buffer)
    }
}
