use crate::{IResult, probe_host, probe_host6, ws};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::combinator::map;
use nom::error::context;
use nom::sequence::preceded;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address with network & address type (`IN IP4 ...`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaggedAddress {
    IP4(Ipv4Addr),
    IP4FQDN(String),
    IP6(Ipv6Addr),
    IP6FQDN(String),
}

impl TaggedAddress {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing tagged address",
            preceded(
                tag("IN"),
                ws(alt((
                    preceded(
                        tag("IP4"),
                        ws(map(take_while1(probe_host), |address: &str| {
                            match Ipv4Addr::from_str(address) {
                                Ok(ip) => TaggedAddress::IP4(ip),
                                Err(_) => TaggedAddress::IP4FQDN(address.into()),
                            }
                        })),
                    ),
                    preceded(
                        tag("IP6"),
                        ws(map(take_while1(probe_host6), |address: &str| {
                            match Ipv6Addr::from_str(address) {
                                Ok(ip) => TaggedAddress::IP6(ip),
                                Err(_) => TaggedAddress::IP6FQDN(address.into()),
                            }
                        })),
                    ),
                ))),
            ),
        )(i)
    }

    /// Returns the IP address if the address isn't a FQDN
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TaggedAddress::IP4(ip) => Some(IpAddr::V4(*ip)),
            TaggedAddress::IP6(ip) => Some(IpAddr::V6(*ip)),
            TaggedAddress::IP4FQDN(_) | TaggedAddress::IP6FQDN(_) => None,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, TaggedAddress::IP6(_) | TaggedAddress::IP6FQDN(_))
    }

    /// The address part without network & address type, e.g. `192.168.0.1`
    pub fn address(&self) -> String {
        match self {
            TaggedAddress::IP4(ip) => ip.to_string(),
            TaggedAddress::IP6(ip) => ip.to_string(),
            TaggedAddress::IP4FQDN(fqdn) | TaggedAddress::IP6FQDN(fqdn) => fqdn.clone(),
        }
    }

    /// The address type, either `IP4` or `IP6`
    pub fn address_type(&self) -> &'static str {
        if self.is_ipv6() { "IP6" } else { "IP4" }
    }
}

impl From<IpAddr> for TaggedAddress {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => TaggedAddress::IP4(ip),
            IpAddr::V6(ip) => TaggedAddress::IP6(ip),
        }
    }
}

impl fmt::Display for TaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IN {} {}", self.address_type(), self.address())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ip4() {
        let (rem, address) = TaggedAddress::parse("IN IP4 192.168.123.222").unwrap();

        assert!(rem.is_empty());
        assert_eq!(address, TaggedAddress::IP4(Ipv4Addr::new(192, 168, 123, 222)));
    }

    #[test]
    fn ip6() {
        let (rem, address) = TaggedAddress::parse("IN IP6 ::1").unwrap();

        assert!(rem.is_empty());
        assert_eq!(address, TaggedAddress::IP6(Ipv6Addr::LOCALHOST));
        assert!(address.is_ipv6());
    }

    #[test]
    fn fqdn() {
        let (rem, address) = TaggedAddress::parse("IN IP4 media.example.com").unwrap();

        assert!(rem.is_empty());
        assert_eq!(address, TaggedAddress::IP4FQDN("media.example.com".into()));
        assert_eq!(address.ip(), None);
    }

    #[test]
    fn print() {
        let address = TaggedAddress::from(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

        assert_eq!(address.to_string(), "IN IP4 10.0.0.1");
    }
}
