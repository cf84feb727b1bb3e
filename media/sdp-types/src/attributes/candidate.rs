//! ICE Candidate (`a=candidate:...`)

use crate::{IResult, ice_char, not_whitespace, probe_host6, ws};
use nom::bytes::complete::{tag, take_while1, take_while_m_n};
use nom::character::complete::digit1;
use nom::combinator::{all_consuming, map, map_res};
use nom::error::context;
use nom::multi::many0;
use nom::sequence::{pair, preceded, tuple};
use nom::Finish;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
#[error("failed to parse ICE candidate")]
pub struct InvalidCandidateError;

/// Connection address of a candidate, either an IP or an FQDN (e.g. an mDNS name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UntaggedAddress {
    Fqdn(String),
    IpAddress(IpAddr),
}

impl UntaggedAddress {
    fn parse(i: &str) -> IResult<'_, Self> {
        map(take_while1(probe_host6), |address: &str| {
            match IpAddr::from_str(address) {
                Ok(address) => UntaggedAddress::IpAddress(address),
                Err(_) => UntaggedAddress::Fqdn(address.into()),
            }
        })(i)
    }
}

impl fmt::Display for UntaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UntaggedAddress::Fqdn(fqdn) => f.write_str(fqdn),
            UntaggedAddress::IpAddress(addr) => addr.fmt(f),
        }
    }
}

/// SDP ICE Candidate
///
/// [RFC5245](https://tools.ietf.org/html/rfc5245#section-15.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// Session unique ID assigned to the candidate
    pub foundation: String,

    /// Identifies the specific component of the media stream for which this is a candidate.
    ///
    /// e.g. RTP is 1 and RTCP is 2
    pub component: u32,

    /// Transport protocol used by the candidate.
    ///
    /// Usually UDP or TCP
    pub transport: String,

    /// Candidate priority
    pub priority: u64,

    /// Address of the candidate
    pub address: UntaggedAddress,

    /// Port of the candidate
    pub port: u16,

    /// Candidate typ
    ///
    /// Defined are:
    /// - `host`: host
    /// - `srflx`: server reflexive
    /// - `prflx`: peer reflexive
    /// - `relay`: relayed candidate
    /// - or something entirely else
    pub typ: String,

    /// Required for candidate typ `srflx`, `prflx` and `relay`
    ///
    /// Transport address
    pub rel_addr: Option<UntaggedAddress>,

    /// Required for candidate typ `srflx`, `prflx` and `relay`
    ///
    /// Transport port
    pub rel_port: Option<u16>,

    /// Params that aren't known to this crate
    pub unknown: Vec<(String, String)>,
}

impl IceCandidate {
    /// Parse a candidate including the `candidate:` prefix
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing ice candidate",
            map_res(
                preceded(
                    tag("candidate:"),
                    tuple((
                        // foundation
                        take_while_m_n(1, 32, ice_char),
                        // component id
                        ws(map_res(digit1, u32::from_str)),
                        // transport
                        ws(take_while1(not_whitespace)),
                        // priority
                        ws(map_res(digit1, u64::from_str)),
                        // address
                        ws(UntaggedAddress::parse),
                        // port
                        ws(map_res(digit1, u16::from_str)),
                        // candidate type
                        preceded(ws(tag("typ")), ws(take_while1(not_whitespace))),
                        // extensions
                        many0(pair(
                            ws(take_while1(not_whitespace)),
                            ws(take_while1(not_whitespace)),
                        )),
                    )),
                ),
                |(foundation, component, transport, priority, address, port, typ, extensions)| {
                    let mut unknown = vec![];
                    let mut rel_addr = None;
                    let mut rel_port = None;

                    for (key, value) in extensions {
                        match key {
                            "raddr" => {
                                let (_, addr) = all_consuming(UntaggedAddress::parse)(value)
                                    .finish()
                                    .map_err(|_| InvalidCandidateError)?;

                                rel_addr = Some(addr);
                            }
                            "rport" => {
                                rel_port =
                                    Some(u16::from_str(value).map_err(|_| InvalidCandidateError)?)
                            }
                            _ => unknown.push((key.to_string(), value.to_string())),
                        }
                    }

                    Ok::<_, InvalidCandidateError>(IceCandidate {
                        foundation: foundation.into(),
                        component,
                        transport: transport.into(),
                        priority,
                        address,
                        port,
                        typ: typ.into(),
                        rel_addr,
                        rel_port,
                        unknown,
                    })
                },
            ),
        )(i)
    }
}

impl FromStr for IceCandidate {
    type Err = InvalidCandidateError;

    /// Parse a candidate as it is exchanged by signaling, `a=` and `candidate:` prefixes are optional
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("a=").unwrap_or(s);

        let prefixed;
        let s = if s.starts_with("candidate:") {
            s
        } else {
            prefixed = format!("candidate:{s}");
            &prefixed
        };

        let (_, candidate) = all_consuming(Self::parse)(s)
            .finish()
            .map_err(|_| InvalidCandidateError)?;

        Ok(candidate)
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.typ
        )?;

        if let Some(rel_addr) = &self.rel_addr {
            write!(f, " raddr {rel_addr}")?;
        }

        if let Some(rel_port) = &self.rel_port {
            write!(f, " rport {rel_port}")?;
        }

        for (key, value) in &self.unknown {
            write!(f, " {key} {value}")?;
        }

        Ok(())
    }
}
