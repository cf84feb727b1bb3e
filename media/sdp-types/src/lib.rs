#![warn(unreachable_pub)]

//! SDP types with parsing & serialization.
//!
//! Covers the parts of a session description that are needed to negotiate plain RTP,
//! SDES-keyed SRTP and ICE/DTLS based WebRTC transports (including data channels).
//! Everything else is kept around as [`UnknownAttribute`] so it survives a parse/print cycle.

use nom::character::complete::{char, digit1, space1};
use nom::combinator::map_res;
use nom::error::VerboseError;
use nom::sequence::preceded;
use std::str::FromStr;

mod attributes;
mod connection;
mod media;
mod media_description;
mod origin;
mod parser;
mod session_description;
mod tagged_address;
mod time;

pub use attributes::{
    Direction, Fingerprint, FingerprintAlgorithm, Group, IceCandidate, InvalidCandidateError,
    Rtcp, Sctpmap, Setup, SrtpCrypto, SrtpKeyingMaterial, SrtpSuite, UnknownAttribute,
    UntaggedAddress,
};
pub use connection::Connection;
pub use media::{Media, MediaType, TransportProtocol};
pub use media_description::MediaDescription;
pub use origin::Origin;
pub use parser::ParseSessionDescriptionError;
pub use session_description::SessionDescription;
pub use tagged_address::TaggedAddress;
pub use time::Time;

pub(crate) type IResult<'i, O> = nom::IResult<&'i str, O, VerboseError<&'i str>>;

/// Run `parser` after at least one space or tab
pub(crate) fn ws<'i, O>(
    parser: impl FnMut(&'i str) -> IResult<'i, O>,
) -> impl FnMut(&'i str) -> IResult<'i, O> {
    preceded(space1, parser)
}

fn slash_num(i: &str) -> IResult<'_, u32> {
    preceded(char('/'), map_res(digit1, u32::from_str))(i)
}

fn not_whitespace(c: char) -> bool {
    !c.is_ascii_whitespace()
}

fn ice_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/')
}

fn probe_host(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn probe_host6(c: char) -> bool {
    probe_host(c) || c == ':'
}
