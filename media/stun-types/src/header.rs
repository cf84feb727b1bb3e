use crate::Error;
use bitfield::bitfield;

pub(crate) const STUN_HEADER_LENGTH: usize = 20;

bitfield! {
    /// First 32 bits of every STUN message
    pub struct MessageHead(u32);

    u8;
    pub z, _: 31, 30;

    u16;
    pub typ, set_typ: 29, 16;

    #[allow(clippy::len_without_is_empty)]
    pub len, set_len: 15, 0;
}

impl MessageHead {
    pub(crate) fn new(class: Class, method: Method) -> Self {
        let mut head = MessageHead(0);
        head.set_typ(method.bits() | class.bits());
        head
    }
}

/// STUN class
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    const MASK: u16 = 0x110;

    const REQUEST: u16 = 0x000;
    const INDICATION: u16 = 0x010;
    const SUCCESS: u16 = 0x100;
    const ERROR: u16 = 0x110;

    fn bits(self) -> u16 {
        match self {
            Class::Request => Self::REQUEST,
            Class::Indication => Self::INDICATION,
            Class::Success => Self::SUCCESS,
            Class::Error => Self::ERROR,
        }
    }

    pub(crate) fn from_typ(typ: u16) -> Self {
        match typ & Self::MASK {
            Self::REQUEST => Self::Request,
            Self::INDICATION => Self::Indication,
            Self::SUCCESS => Self::Success,
            _ => Self::Error,
        }
    }
}

/// STUN/TURN Methods
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Method {
    // === STUN ===
    Binding,

    // === TURN ===
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
}

impl Method {
    const MASK: u16 = 0x3EEF;

    const BINDING: u16 = 0x1;
    const ALLOCATE: u16 = 0x3;
    const REFRESH: u16 = 0x4;
    const SEND: u16 = 0x6;
    const DATA: u16 = 0x7;
    const CREATE_PERMISSION: u16 = 0x8;
    const CHANNEL_BIND: u16 = 0x9;

    fn bits(self) -> u16 {
        match self {
            Method::Binding => Self::BINDING,
            Method::Allocate => Self::ALLOCATE,
            Method::Refresh => Self::REFRESH,
            Method::Send => Self::SEND,
            Method::Data => Self::DATA,
            Method::CreatePermission => Self::CREATE_PERMISSION,
            Method::ChannelBind => Self::CHANNEL_BIND,
        }
    }

    pub(crate) fn from_typ(typ: u16) -> Result<Self, Error> {
        match typ & Self::MASK {
            Self::BINDING => Ok(Self::Binding),
            Self::ALLOCATE => Ok(Self::Allocate),
            Self::REFRESH => Ok(Self::Refresh),
            Self::SEND => Ok(Self::Send),
            Self::DATA => Ok(Self::Data),
            Self::CREATE_PERMISSION => Ok(Self::CreatePermission),
            Self::CHANNEL_BIND => Ok(Self::ChannelBind),
            _ => Err(Error::InvalidData("unknown method")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binding_success_type() {
        let head = MessageHead::new(Class::Success, Method::Binding);

        assert_eq!(head.typ(), 0x0101);
        assert_eq!(Class::from_typ(head.typ()), Class::Success);
        assert_eq!(Method::from_typ(head.typ()).unwrap(), Method::Binding);
    }

    #[test]
    fn allocate_error_type() {
        let head = MessageHead::new(Class::Error, Method::Allocate);

        assert_eq!(head.typ(), 0x0113);
        assert_eq!(Class::from_typ(0x0113), Class::Error);
    }
}
