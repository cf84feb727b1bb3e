use crate::{IResult, not_whitespace, slash_num, ws};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, opt};
use nom::error::context;
use nom::multi::many0;
use nom::sequence::tuple;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
    Text,
    App,
}

impl MediaType {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing media type",
            alt((
                map(tag("audio"), |_| MediaType::Audio),
                map(tag("video"), |_| MediaType::Video),
                map(tag("text"), |_| MediaType::Text),
                map(tag("application"), |_| MediaType::App),
            )),
        )(i)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => f.write_str("audio"),
            MediaType::Video => f.write_str("video"),
            MediaType::Text => f.write_str("text"),
            MediaType::App => f.write_str("application"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Unspecified,

    /// RTP over UDP
    RtpAvp,

    /// RTP with [RFC4585](https://www.rfc-editor.org/rfc/rfc4585.html) feedback
    RtpAvpf,

    /// SRTP over UDP
    RtpSavp,

    /// SRTP with [RFC5124](https://www.rfc-editor.org/rfc/rfc5124.html)
    RtpSavpf,

    /// DTLS-SRTP
    UdpTlsRtpSavp,

    /// DTLS-SRTP with [RFC5124](https://www.rfc-editor.org/rfc/rfc5124.html)
    UdpTlsRtpSavpf,

    /// SCTP over DTLS (data channels)
    DtlsSctp,

    /// SCTP over DTLS over UDP (data channels)
    UdpDtlsSctp,

    /// Other unknown
    Other(String),
}

impl TransportProtocol {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        map(take_while1(not_whitespace), Self::from_name)(i)
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "udp" => TransportProtocol::Unspecified,
            "RTP/AVP" => TransportProtocol::RtpAvp,
            "RTP/AVPF" => TransportProtocol::RtpAvpf,
            "RTP/SAVP" => TransportProtocol::RtpSavp,
            "RTP/SAVPF" => TransportProtocol::RtpSavpf,
            "UDP/TLS/RTP/SAVP" => TransportProtocol::UdpTlsRtpSavp,
            "UDP/TLS/RTP/SAVPF" => TransportProtocol::UdpTlsRtpSavpf,
            "DTLS/SCTP" => TransportProtocol::DtlsSctp,
            "UDP/DTLS/SCTP" => TransportProtocol::UdpDtlsSctp,
            other => TransportProtocol::Other(other.into()),
        }
    }

    /// Protocol carries SCTP data channels
    pub fn is_sctp(&self) -> bool {
        matches!(
            self,
            TransportProtocol::DtlsSctp | TransportProtocol::UdpDtlsSctp
        )
    }

    /// Protocol uses DTLS for keying
    pub fn is_dtls(&self) -> bool {
        matches!(
            self,
            TransportProtocol::UdpTlsRtpSavp
                | TransportProtocol::UdpTlsRtpSavpf
                | TransportProtocol::DtlsSctp
                | TransportProtocol::UdpDtlsSctp
        )
    }

    /// Protocol uses SDES (`a=crypto`) for keying
    pub fn is_sdes(&self) -> bool {
        matches!(
            self,
            TransportProtocol::RtpSavp | TransportProtocol::RtpSavpf
        )
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Unspecified => f.write_str("udp"),
            TransportProtocol::RtpAvp => f.write_str("RTP/AVP"),
            TransportProtocol::RtpAvpf => f.write_str("RTP/AVPF"),
            TransportProtocol::RtpSavp => f.write_str("RTP/SAVP"),
            TransportProtocol::RtpSavpf => f.write_str("RTP/SAVPF"),
            TransportProtocol::UdpTlsRtpSavp => f.write_str("UDP/TLS/RTP/SAVP"),
            TransportProtocol::UdpTlsRtpSavpf => f.write_str("UDP/TLS/RTP/SAVPF"),
            TransportProtocol::DtlsSctp => f.write_str("DTLS/SCTP"),
            TransportProtocol::UdpDtlsSctp => f.write_str("UDP/DTLS/SCTP"),
            TransportProtocol::Other(other) => f.write_str(other),
        }
    }
}

/// Media field (`m=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.14)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub media_type: MediaType,
    pub port: u16,
    pub ports_num: Option<u32>,
    pub proto: TransportProtocol,
    /// Media formats, RTP payload types or e.g. the SCTP port for data channels
    pub fmts: Vec<String>,
}

impl Media {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing media field",
            map(
                tuple((
                    MediaType::parse,
                    ws(map_res(digit1, u16::from_str)),
                    opt(slash_num),
                    ws(TransportProtocol::parse),
                    many0(ws(map(take_while1(not_whitespace), String::from))),
                )),
                |(media_type, port, ports_num, proto, fmts)| Media {
                    media_type,
                    port,
                    ports_num,
                    proto,
                    fmts,
                },
            ),
        )(i)
    }
}

impl fmt::Display for Media {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media_type)?;

        if let Some(ports_num) = &self.ports_num {
            write!(f, " {}/{} ", self.port, ports_num)?;
        } else {
            write!(f, " {} ", self.port)?;
        }

        write!(f, "{}", self.proto)?;

        for fmt in &self.fmts {
            write!(f, " {fmt}")?;
        }

        Ok(())
    }
}
