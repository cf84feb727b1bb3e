use crate::{IResult, not_whitespace, ws};
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, not, opt, peek};
use nom::error::context;
use nom::multi::{many0, separated_list1};
use nom::sequence::{preceded, separated_pair, terminated, tuple};
use std::fmt;
use std::str::FromStr;

/// Crypto attribute (for SDES keyed SRTP only) (`a=crypto`)
///
/// [RFC4568](https://www.rfc-editor.org/rfc/rfc4568)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpCrypto {
    /// Unique identifier in a media description
    pub tag: u32,

    /// Crypto suite describing the encryption and authentication algorithm to use
    pub suite: SrtpSuite,

    /// One or more keys to use
    pub keys: Vec<SrtpKeyingMaterial>,

    /// Additional session params, kept verbatim
    pub params: Vec<String>,
}

impl SrtpCrypto {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing srtp-crypto attribute",
            map(
                tuple((
                    // tag
                    map_res(digit1, u32::from_str),
                    // suite
                    ws(map(take_while1(is_suite_char), SrtpSuite::from_name)),
                    // keying material
                    ws(separated_list1(
                        char(';'),
                        preceded(tag("inline:"), SrtpKeyingMaterial::parse),
                    )),
                    // session params
                    many0(ws(map(take_while1(not_whitespace), String::from))),
                )),
                |(tag, suite, keys, params)| Self {
                    tag,
                    suite,
                    keys,
                    params,
                },
            ),
        )(i)
    }
}

impl fmt::Display for SrtpCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tag, self.suite)?;

        let mut keys = self.keys.iter();

        if let Some(key) = keys.next() {
            write!(f, " inline:{key}")?;

            for key in keys {
                write!(f, ";inline:{key}")?;
            }
        }

        for param in &self.params {
            write!(f, " {param}")?;
        }

        Ok(())
    }
}

/// SRTP crypto suites
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum SrtpSuite {
    AES_CM_128_HMAC_SHA1_32,
    AES_CM_128_HMAC_SHA1_80,
    AES_256_CM_HMAC_SHA1_32,
    AES_256_CM_HMAC_SHA1_80,
    Other(String),
}

impl SrtpSuite {
    pub fn from_name(name: &str) -> Self {
        match name {
            "AES_CM_128_HMAC_SHA1_32" => Self::AES_CM_128_HMAC_SHA1_32,
            "AES_CM_128_HMAC_SHA1_80" => Self::AES_CM_128_HMAC_SHA1_80,
            "AES_256_CM_HMAC_SHA1_32" => Self::AES_256_CM_HMAC_SHA1_32,
            "AES_256_CM_HMAC_SHA1_80" => Self::AES_256_CM_HMAC_SHA1_80,
            other => Self::Other(other.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::AES_CM_128_HMAC_SHA1_32 => "AES_CM_128_HMAC_SHA1_32",
            Self::AES_CM_128_HMAC_SHA1_80 => "AES_CM_128_HMAC_SHA1_80",
            Self::AES_256_CM_HMAC_SHA1_32 => "AES_256_CM_HMAC_SHA1_32",
            Self::AES_256_CM_HMAC_SHA1_80 => "AES_256_CM_HMAC_SHA1_80",
            Self::Other(other) => other,
        }
    }

    /// Length of master key and master salt in bytes
    pub fn key_and_salt_len(&self) -> Option<(usize, usize)> {
        match self {
            Self::AES_CM_128_HMAC_SHA1_32 | Self::AES_CM_128_HMAC_SHA1_80 => Some((16, 14)),
            Self::AES_256_CM_HMAC_SHA1_32 | Self::AES_256_CM_HMAC_SHA1_80 => Some((32, 14)),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for SrtpSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpKeyingMaterial {
    /// Concatenated master key and salt, base64 encoded
    pub key_and_salt: String,

    /// Master key lifetime, either a number or `2^n`
    pub lifetime: Option<String>,

    /// Master key index and length of the MKI field in SRTP packets
    pub mki: Option<(u32, u32)>,
}

impl SrtpKeyingMaterial {
    pub fn new(key_and_salt: String) -> Self {
        Self {
            key_and_salt,
            lifetime: None,
            mki: None,
        }
    }

    fn parse(i: &str) -> IResult<'_, Self> {
        context(
            "parsing keying material",
            map(
                tuple((
                    // key and salt
                    take_while1(is_base64_char),
                    // lifetime
                    opt(preceded(
                        char('|'),
                        terminated(
                            take_while1(|c: char| c.is_ascii_digit() || c == '^'),
                            // Do not parse the mki here by mistake
                            peek(not(char(':'))),
                        ),
                    )),
                    // mki
                    opt(preceded(
                        char('|'),
                        separated_pair(
                            map_res(digit1, u32::from_str),
                            char(':'),
                            map_res(digit1, u32::from_str),
                        ),
                    )),
                )),
                |(key_and_salt, lifetime, mki): (&str, Option<&str>, _)| Self {
                    key_and_salt: key_and_salt.into(),
                    lifetime: lifetime.map(String::from),
                    mki,
                },
            ),
        )(i)
    }
}

impl fmt::Display for SrtpKeyingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_and_salt)?;

        if let Some(lifetime) = &self.lifetime {
            write!(f, "|{lifetime}")?;
        }

        if let Some((mki, mki_length)) = self.mki {
            write!(f, "|{mki}:{mki_length}")?;
        }

        Ok(())
    }
}

fn is_suite_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_base64_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crypto() {
        let input = "1 AES_CM_128_HMAC_SHA1_80 inline:WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz|2^20|1:4";

        let (rem, crypto) = SrtpCrypto::parse(input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(crypto.tag, 1);
        assert_eq!(crypto.suite, SrtpSuite::AES_CM_128_HMAC_SHA1_80);
        assert_eq!(crypto.keys.len(), 1);
        assert_eq!(
            crypto.keys[0].key_and_salt,
            "WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz"
        );
        assert_eq!(crypto.keys[0].lifetime.as_deref(), Some("2^20"));
        assert_eq!(crypto.keys[0].mki, Some((1, 4)));
        assert_eq!(crypto.to_string(), input);
    }

    #[test]
    fn crypto_mki_without_lifetime() {
        let (rem, crypto) =
            SrtpCrypto::parse("2 AES_256_CM_HMAC_SHA1_32 inline:YUJDZGVmZ2hpSktMbW9QUXJzVFVWd3l6|5:4 KDR=1")
                .unwrap();

        assert!(rem.is_empty());
        assert_eq!(crypto.suite, SrtpSuite::AES_256_CM_HMAC_SHA1_32);
        assert_eq!(crypto.keys[0].lifetime, None);
        assert_eq!(crypto.keys[0].mki, Some((5, 4)));
        assert_eq!(crypto.params, ["KDR=1"]);
    }

    #[test]
    fn key_sizes() {
        assert_eq!(
            SrtpSuite::AES_CM_128_HMAC_SHA1_32.key_and_salt_len(),
            Some((16, 14))
        );
        assert_eq!(
            SrtpSuite::AES_256_CM_HMAC_SHA1_80.key_and_salt_len(),
            Some((32, 14))
        );
        assert_eq!(SrtpSuite::from_name("F8_128_HMAC_SHA1_80").key_and_salt_len(), None);
    }
}
