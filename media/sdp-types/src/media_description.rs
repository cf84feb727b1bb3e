use crate::{
    Connection, Direction, Fingerprint, IceCandidate, Media, MediaType, Rtcp, Sctpmap, Setup,
    SrtpCrypto, TransportProtocol, UnknownAttribute,
};
use std::fmt;

/// Part of the [`SessionDescription`](crate::SessionDescription) describes a single media session
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.14)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// Media description's media field (m=)
    pub media: Media,

    /// Optional connection (c field)
    pub connection: Option<Connection>,

    /// Media direction attribute
    pub direction: Direction,

    /// rtcp attribute
    pub rtcp: Option<Rtcp>,

    /// rtcp-mux attribute
    pub rtcp_mux: bool,

    /// Media ID (a=mid)
    pub mid: Option<String>,

    /// ICE username fragment
    pub ice_ufrag: Option<String>,

    /// ICE password
    pub ice_pwd: Option<String>,

    /// ICE candidates
    pub ice_candidates: Vec<IceCandidate>,

    /// ICE a=end-of-candidates attribute
    pub ice_end_of_candidates: bool,

    /// Setup attribute (a=setup)
    pub setup: Option<Setup>,

    /// Fingerprint attribute (a=fingerprint)
    pub fingerprint: Vec<Fingerprint>,

    /// Crypto attributes
    pub crypto: Vec<SrtpCrypto>,

    /// SCTP association mappings (a=sctpmap)
    pub sctpmap: Vec<Sctpmap>,

    /// Additional attributes
    pub attributes: Vec<UnknownAttribute>,
}

impl MediaDescription {
    pub fn new(media_type: MediaType, port: u16, proto: TransportProtocol, fmts: Vec<String>) -> Self {
        MediaDescription {
            media: Media {
                media_type,
                port,
                ports_num: None,
                proto,
                fmts,
            },
            connection: None,
            direction: Direction::SendRecv,
            rtcp: None,
            rtcp_mux: false,
            mid: None,
            ice_ufrag: None,
            ice_pwd: None,
            ice_candidates: vec![],
            ice_end_of_candidates: false,
            setup: None,
            fingerprint: vec![],
            crypto: vec![],
            sctpmap: vec![],
            attributes: vec![],
        }
    }

    /// Create media description which signals rejected media
    pub fn rejected(media_type: MediaType, proto: TransportProtocol) -> Self {
        let mut desc = Self::new(media_type, 0, proto, vec![]);
        desc.direction = Direction::Inactive;
        desc
    }

    /// Turn this description into a rejected one, keeping media type, protocol, formats and mid
    pub fn reject(&mut self) {
        self.media.port = 0;
        self.direction = Direction::Inactive;
        self.connection = None;
        self.rtcp = None;
        self.ice_candidates.clear();
        self.crypto.clear();
    }

    pub fn is_rejected(&self) -> bool {
        self.media.port == 0
    }

    /// Returns the value of the first unknown attribute with the given name
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .and_then(|attr| attr.value.as_deref())
    }
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={}\r\n", self.media)?;

        if let Some(conn) = &self.connection {
            write!(f, "c={conn}\r\n")?;
        }

        write!(f, "a={}\r\n", self.direction)?;

        if let Some(rtcp) = &self.rtcp {
            write!(f, "a=rtcp:{rtcp}\r\n")?;
        }

        if self.rtcp_mux {
            write!(f, "a=rtcp-mux\r\n")?;
        }

        if let Some(mid) = &self.mid {
            write!(f, "a=mid:{mid}\r\n")?;
        }

        if let Some(ufrag) = &self.ice_ufrag {
            write!(f, "a=ice-ufrag:{ufrag}\r\n")?;
        }

        if let Some(pwd) = &self.ice_pwd {
            write!(f, "a=ice-pwd:{pwd}\r\n")?;
        }

        for candidate in &self.ice_candidates {
            write!(f, "a={candidate}\r\n")?;
        }

        if self.ice_end_of_candidates {
            write!(f, "a=end-of-candidates\r\n")?;
        }

        if let Some(setup) = self.setup {
            write!(f, "a=setup:{setup}\r\n")?;
        }

        for fingerprint in &self.fingerprint {
            write!(f, "a=fingerprint:{fingerprint}\r\n")?;
        }

        for crypto in &self.crypto {
            write!(f, "a=crypto:{crypto}\r\n")?;
        }

        for sctpmap in &self.sctpmap {
            write!(f, "a=sctpmap:{sctpmap}\r\n")?;
        }

        for attr in &self.attributes {
            write!(f, "{attr}\r\n")?;
        }

        Ok(())
    }
}
