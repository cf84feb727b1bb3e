use crate::{IResult, not_whitespace};
use nom::bytes::complete::{take, take_while1};
use nom::character::complete::{char, space1};
use nom::combinator::{map, map_res};
use nom::error::context;
use nom::multi::separated_list1;
use nom::sequence::separated_pair;
use std::fmt;

/// Certificate fingerprint attribute (`a=fingerprint`)
///
/// [RFC8122](https://www.rfc-editor.org/rfc/rfc8122#section-5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: FingerprintAlgorithm,
    pub fingerprint: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintAlgorithm {
    SHA1,
    SHA224,
    SHA256,
    SHA384,
    SHA512,
    MD5,
    Other(String),
}

impl Fingerprint {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing fingerprint-attribute",
            map(
                separated_pair(
                    map(take_while1(not_whitespace), FingerprintAlgorithm::from_name),
                    space1,
                    separated_list1(
                        char(':'),
                        map_res(take(2usize), |hex: &str| u8::from_str_radix(hex, 16)),
                    ),
                ),
                |(algorithm, fingerprint)| Self {
                    algorithm,
                    fingerprint,
                },
            ),
        )(i)
    }
}

impl FingerprintAlgorithm {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "sha-1" => Self::SHA1,
            "sha-224" => Self::SHA224,
            "sha-256" => Self::SHA256,
            "sha-384" => Self::SHA384,
            "sha-512" => Self::SHA512,
            "md5" => Self::MD5,
            _ => Self::Other(name.into()),
        }
    }
}

impl fmt::Display for FingerprintAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FingerprintAlgorithm::SHA1 => "sha-1",
            FingerprintAlgorithm::SHA224 => "sha-224",
            FingerprintAlgorithm::SHA256 => "sha-256",
            FingerprintAlgorithm::SHA384 => "sha-384",
            FingerprintAlgorithm::SHA512 => "sha-512",
            FingerprintAlgorithm::MD5 => "md5",
            FingerprintAlgorithm::Other(other) => other,
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.algorithm)?;

        let mut iter = self.fingerprint.iter();

        if let Some(b) = iter.next() {
            write!(f, "{b:02X}")?;

            for b in iter {
                write!(f, ":{b:02X}")?;
            }
        }

        Ok(())
    }
}
