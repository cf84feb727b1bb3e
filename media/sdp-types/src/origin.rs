use crate::{IResult, TaggedAddress, not_whitespace, ws};
use nom::bytes::complete::take_while1;
use nom::character::complete::digit1;
use nom::combinator::{map, map_res};
use nom::error::context;
use nom::sequence::tuple;
use std::fmt;
use std::str::FromStr;

/// Origin field (`o=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Login of the user on the originating host, `-` if not supported
    pub username: String,

    /// Globally unique identifier of the session
    pub session_id: u64,

    /// Incremented on every modification of the session description
    pub session_version: u64,

    /// Address of the originating machine
    pub address: TaggedAddress,
}

impl Origin {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing origin",
            map(
                tuple((
                    take_while1(not_whitespace),
                    ws(map_res(digit1, u64::from_str)),
                    ws(map_res(digit1, u64::from_str)),
                    ws(TaggedAddress::parse),
                )),
                |(username, session_id, session_version, address)| Origin {
                    username: username.into(),
                    session_id,
                    session_version,
                    address,
                },
            ),
        )(i)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.username, self.session_id, self.session_version, self.address
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn origin() {
        let (rem, origin) = Origin::parse("- 34908 21938 IN IP4 127.0.0.1").unwrap();

        assert!(rem.is_empty());
        assert_eq!(origin.username, "-");
        assert_eq!(origin.session_id, 34908);
        assert_eq!(origin.session_version, 21938);
        assert_eq!(origin.address, TaggedAddress::IP4(Ipv4Addr::LOCALHOST));
    }
}
