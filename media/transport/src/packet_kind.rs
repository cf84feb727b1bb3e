use stun_types::{IsStunMessageInfo, is_stun_message};

/// Classification of a datagram received on a connection's socket (RFC 7983)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketKind {
    Rtp,
    Rtcp,
    Stun,
    Dtls,
    Unknown,
}

impl PacketKind {
    pub(crate) fn identify(bytes: &[u8]) -> Self {
        if bytes.len() < 2 {
            return PacketKind::Unknown;
        }

        match bytes[0] {
            0 | 1 => match is_stun_message(bytes) {
                IsStunMessageInfo::Yes { .. } => PacketKind::Stun,
                IsStunMessageInfo::TooShort
                | IsStunMessageInfo::No
                | IsStunMessageInfo::YesIncomplete { .. } => PacketKind::Unknown,
            },
            20..=63 => PacketKind::Dtls,
            128..=191 => {
                if let 64..=95 = bytes[1] & 0x7F {
                    PacketKind::Rtcp
                } else {
                    PacketKind::Rtp
                }
            }
            _ => PacketKind::Unknown,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identify() {
        assert_eq!(PacketKind::identify(&[0x80, 0x60, 0, 1]), PacketKind::Rtp);
        assert_eq!(PacketKind::identify(&[0x80, 0xC8, 0, 6]), PacketKind::Rtcp);
        assert_eq!(PacketKind::identify(&[0x81, 0xC9, 0, 7]), PacketKind::Rtcp);
        assert_eq!(PacketKind::identify(&[22, 0xFE, 0xFD]), PacketKind::Dtls);
        assert_eq!(PacketKind::identify(&[0x80]), PacketKind::Unknown);
        assert_eq!(PacketKind::identify(&[0xFF, 0xFF]), PacketKind::Unknown);

        // Too short to be a STUN header
        assert_eq!(PacketKind::identify(&[0, 1, 0, 0]), PacketKind::Unknown);
    }
}
