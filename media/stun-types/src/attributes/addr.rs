use super::Attribute;
use crate::{COOKIE, Error, Message, MessageBuilder, NE, TransactionId};
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

const XOR16: u16 = (COOKIE >> 16) as u16;

fn xor128(transaction_id: TransactionId) -> u128 {
    let mut id = [0u8; 16];
    id[..4].copy_from_slice(&COOKIE.to_be_bytes());
    id[4..].copy_from_slice(transaction_id.as_bytes());
    u128::from_be_bytes(id)
}

fn decode_xor_addr(mut buf: &[u8], transaction_id: TransactionId) -> Result<SocketAddr, Error> {
    if buf.read_u8()? != 0 {
        return Err(Error::InvalidData("first byte must be zero"));
    }

    let family = buf.read_u8()?;
    let port = buf.read_u16::<NE>()? ^ XOR16;

    let addr = match family {
        1 => {
            let ip = buf.read_u32::<NE>()? ^ COOKIE;
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))
        }
        2 => {
            let ip = buf.read_u128::<NE>()? ^ xor128(transaction_id);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0))
        }
        _ => {
            return Err(Error::InvalidData("invalid address family"));
        }
    };

    Ok(addr)
}

fn encode_xor_addr(addr: SocketAddr, builder: &mut MessageBuilder) {
    let transaction_id = builder.transaction_id();
    let buf = builder.buffer();

    buf.put_u8(0);

    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(1);
            buf.put_u16(addr.port() ^ XOR16);
            buf.put_u32(u32::from(*addr.ip()) ^ COOKIE);
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(2);
            buf.put_u16(addr.port() ^ XOR16);
            buf.put_u128(u128::from(*addr.ip()) ^ xor128(transaction_id));
        }
    }
}

macro_rules! xor_addr_attribute {
    ($(#[$meta:meta])* $name:ident, $typ:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub SocketAddr);

        impl Attribute for $name {
            const TYPE: u16 = $typ;

            fn decode(msg: &Message, value: &[u8]) -> Result<Self, Error> {
                decode_xor_addr(value, msg.transaction_id()).map(Self)
            }

            fn encode(&self, builder: &mut MessageBuilder) {
                encode_xor_addr(self.0, builder);
            }

            fn encode_len(&self) -> Result<u16, Error> {
                match self.0 {
                    SocketAddr::V4(_) => Ok(8),
                    SocketAddr::V6(_) => Ok(20),
                }
            }
        }
    };
}

xor_addr_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.2)
    XorMappedAddress,
    0x0020
);

xor_addr_attribute!(
    /// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.3)
    XorPeerAddress,
    0x0012
);

xor_addr_attribute!(
    /// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.5)
    XorRelayedAddress,
    0x0016
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Class, Method};

    fn roundtrip(addr: SocketAddr) -> SocketAddr {
        let mut builder =
            MessageBuilder::new(Class::Success, Method::Binding, TransactionId::random());
        builder.add_attr(&XorMappedAddress(addr));

        let msg = Message::parse(builder.finish().unwrap()).unwrap();
        msg.attribute::<XorMappedAddress>().unwrap().unwrap().0
    }

    #[test]
    fn xor_mapped_address() {
        let v4: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let v6: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853".parse().unwrap();

        assert_eq!(roundtrip(v4), v4);
        assert_eq!(roundtrip(v6), v6);
    }

    #[test]
    fn xor_mapped_address_wire_format() {
        // RFC5769 2.2 sample response, XOR-MAPPED-ADDRESS value for 192.0.2.1:32853
        let value = [0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43];

        let addr = decode_xor_addr(&value, TransactionId::new([0; 12])).unwrap();

        assert_eq!(addr, "192.0.2.1:32853".parse::<SocketAddr>().unwrap());
    }
}
