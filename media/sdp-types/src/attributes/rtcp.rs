//! RTCP Attribute (`a=rtcp:...`)

use crate::{IResult, TaggedAddress, ws};
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, opt};
use nom::error::context;
use nom::sequence::tuple;
use std::fmt;
use std::str::FromStr;

/// Rtcp attribute (`a=rtcp`)
///
/// Specify an alternative address/port for RTCP
///
/// Media Level attribute
///
/// [RFC3605](https://datatracker.ietf.org/doc/html/rfc3605)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtcp {
    /// Port to be used for RTCP
    pub port: u16,

    /// Optional address
    pub address: Option<TaggedAddress>,
}

impl Rtcp {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing rtcp field",
            map(
                tuple((
                    // port
                    map_res(digit1, u16::from_str),
                    // optional tagged address
                    opt(ws(TaggedAddress::parse)),
                )),
                |(port, address)| Rtcp { port, address },
            ),
        )(i)
    }
}

impl fmt::Display for Rtcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)?;

        if let Some(address) = &self.address {
            write!(f, " {address}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rtcp() {
        let (rem, rtcp) = Rtcp::parse("4444").unwrap();

        assert!(rem.is_empty());
        assert_eq!(rtcp.port, 4444);
        assert!(rtcp.address.is_none());
    }

    #[test]
    fn rtcp_address() {
        let (rem, rtcp) = Rtcp::parse("4444 IN IP4 192.168.123.222").unwrap();

        assert!(rem.is_empty());
        assert_eq!(rtcp.port, 4444);
        assert!(
            matches!(rtcp.address, Some(TaggedAddress::IP4(ip)) if ip == Ipv4Addr::new(192, 168, 123, 222))
        );
        assert_eq!(rtcp.to_string(), "4444 IN IP4 192.168.123.222");
    }
}
