use crate::{IResult, TaggedAddress, slash_num};
use nom::combinator::opt;
use nom::sequence::pair;
use std::fmt;

/// Connection field (`c=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// The connection address
    pub address: TaggedAddress,

    /// Must be set for IPv4 multicast sessions
    pub ttl: Option<u32>,

    /// Number of addresses
    pub num: Option<u32>,
}

impl Connection {
    pub fn new(address: TaggedAddress) -> Self {
        Self {
            address,
            ttl: None,
            num: None,
        }
    }

    pub fn parse(i: &str) -> IResult<'_, Self> {
        let (i, address) = TaggedAddress::parse(i)?;

        if address.is_ipv6() {
            let (i, num) = opt(slash_num)(i)?;

            return Ok((
                i,
                Connection {
                    address,
                    ttl: None,
                    num,
                },
            ));
        }

        let (i, ttl) = opt(pair(slash_num, opt(slash_num)))(i)?;

        let (ttl, num) = match ttl {
            Some((ttl, num)) => (Some(ttl), num),
            None => (None, None),
        };

        Ok((i, Connection { address, ttl, num }))
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;

        if self.address.is_ipv6() {
            if let Some(num) = self.num {
                write!(f, "/{num}")?;
            }

            return Ok(());
        }

        if let Some(ttl) = self.ttl {
            write!(f, "/{ttl}")?;

            if let Some(num) = self.num {
                write!(f, "/{num}")?;
            }
        }

        Ok(())
    }
}
