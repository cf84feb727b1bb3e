use crate::{IResult, not_whitespace, ws};
use nom::bytes::complete::take_while1;
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, opt};
use nom::error::context;
use nom::sequence::tuple;
use std::fmt;
use std::str::FromStr;

/// SCTP association mapping (`a=sctpmap:5000 webrtc-datachannel 1024`)
///
/// [draft-ietf-mmusic-sctp-sdp-05](https://datatracker.ietf.org/doc/html/draft-ietf-mmusic-sctp-sdp-05#section-5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sctpmap {
    /// SCTP port, matches the format of the media line
    pub port: u16,

    /// Application protocol, only `webrtc-datachannel` is of interest
    pub app: String,

    /// Maximum number of streams
    pub streams: Option<u32>,
}

impl Sctpmap {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing sctpmap",
            map(
                tuple((
                    map_res(digit1, u16::from_str),
                    ws(take_while1(not_whitespace)),
                    opt(ws(map_res(digit1, u32::from_str))),
                )),
                |(port, app, streams)| Self {
                    port,
                    app: app.into(),
                    streams,
                },
            ),
        )(i)
    }

    pub fn is_webrtc_datachannel(&self) -> bool {
        self.app == "webrtc-datachannel"
    }
}

impl fmt::Display for Sctpmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.port, self.app)?;

        if let Some(streams) = self.streams {
            write!(f, " {streams}")?;
        }

        Ok(())
    }
}
