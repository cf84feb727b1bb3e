use std::fmt;

mod candidate;
mod crypto;
mod direction;
mod fingerprint;
mod group;
mod rtcp;
mod sctpmap;
mod setup;

pub use candidate::{IceCandidate, InvalidCandidateError, UntaggedAddress};
pub use crypto::{SrtpCrypto, SrtpKeyingMaterial, SrtpSuite};
pub use direction::Direction;
pub use fingerprint::{Fingerprint, FingerprintAlgorithm};
pub use group::Group;
pub use rtcp::Rtcp;
pub use sctpmap::Sctpmap;
pub use setup::Setup;

/// `name:[value]` pair which contains an unparsed/unknown attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAttribute {
    /// Attribute name, the part before the optional `:`
    pub name: String,

    /// if the optional `:` is present the part parsed after is stored inside `value`
    pub value: Option<String>,
}

impl UnknownAttribute {
    pub fn parse(line: &str) -> Self {
        match line.split_once(':') {
            None => Self {
                name: line.into(),
                value: None,
            },
            Some((name, value)) => Self {
                name: name.into(),
                value: Some(value.into()),
            },
        }
    }
}

impl fmt::Display for UnknownAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a={}", self.name)?;

        if let Some(value) = &self.value {
            write!(f, ":{value}")?;
        }

        Ok(())
    }
}
